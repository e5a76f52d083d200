//! Built-in client protocol for the server binary.
//!
//! | event       | data                           | effect                      |
//! |-------------|--------------------------------|-----------------------------|
//! | `join`      | `{room}`                       | join for broadcast+presence |
//! | `leave`     | `{room}`                       | leave                       |
//! | `broadcast` | `{room, eventName, data}`      | room broadcast              |
//! | `presence`  | `{room, key?}`                 | stream the room's count     |
//!
//! Requests carrying a `requestToken` are answered with `{"ok": true}` or
//! `{"error": "<reason>"}`.

use roomcast_core::{Environment, Responder, Transport};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{HubDriver, SocketHandle};

/// Why a demo request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// Request data did not match the expected shape
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    /// Room name was empty
    #[error("room name must not be empty")]
    EmptyRoom,
}

#[derive(Debug, Deserialize)]
struct RoomRequest {
    room: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastRequest {
    room: String,
    event_name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct PresenceRequest {
    room: String,
    key: Option<String>,
}

fn parse<R: for<'de> Deserialize<'de>>(data: &Value) -> Result<R, DemoError> {
    Ok(R::deserialize(data)?)
}

fn non_empty(room: &str) -> Result<(), DemoError> {
    if room.is_empty() { Err(DemoError::EmptyRoom) } else { Ok(()) }
}

fn ack<T: Transport>(responder: Option<Responder<T>>, outcome: Result<(), DemoError>) {
    let Some(responder) = responder else {
        if let Err(err) = outcome {
            tracing::debug!(%err, "rejected request without token");
        }
        return;
    };
    match outcome {
        Ok(()) => responder.respond(json!({ "ok": true })),
        Err(err) => responder.respond(json!({ "error": err.to_string() })),
    }
}

fn join(handle: &SocketHandle, data: &Value) -> Result<(), DemoError> {
    let request: RoomRequest = parse(data)?;
    non_empty(&request.room)?;
    handle.join(&request.room);
    Ok(())
}

fn leave(handle: &SocketHandle, data: &Value) -> Result<(), DemoError> {
    let request: RoomRequest = parse(data)?;
    handle.leave(&request.room);
    Ok(())
}

fn broadcast(handle: &SocketHandle, data: &Value) -> Result<(), DemoError> {
    let request: BroadcastRequest = parse(data)?;
    non_empty(&request.room)?;
    handle.broadcast(&request.room, &request.event_name, request.data);
    Ok(())
}

fn presence(handle: &SocketHandle, data: &Value) -> Result<(), DemoError> {
    let request: PresenceRequest = parse(data)?;
    non_empty(&request.room)?;
    handle.subscribe_presence(&request.room, request.key.as_deref());
    Ok(())
}

/// Register the demo protocol as the hub's connection handler.
pub fn install_demo_protocol<E, T>(hub: &mut HubDriver<E, T>)
where
    E: Environment,
    T: Transport,
{
    type Op = fn(&SocketHandle, &Value) -> Result<(), DemoError>;
    const OPS: [(&str, Op); 4] =
        [("join", join), ("leave", leave), ("broadcast", broadcast), ("presence", presence)];

    hub.on_connection(|socket| {
        for (event_name, op) in OPS {
            let handle = socket.handle();
            socket.on(event_name, move |data, responder| ack(responder, op(&handle, data)));
        }
    });
}
