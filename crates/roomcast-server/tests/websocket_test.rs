//! End-to-end tests over real WebSockets.
//!
//! Two servers share one in-process bus; clients speak the demo protocol.

use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use roomcast_server::{
    HubConfig, LocalBusHub, Server, ServerRuntimeConfig, install_demo_protocol,
};
use serde_json::{Value, json};
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(bus: &LocalBusHub) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let config =
        ServerRuntimeConfig { bind_address: "127.0.0.1:0".to_string(), hub: HubConfig::default() };
    let mut server = Server::bind_with_bus(config, bus).await.unwrap();
    install_demo_protocol(server.hub_mut());
    let addr = server.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    (addr, stop_tx, task)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    client
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

/// Read until an event named `event_name` arrives.
async fn expect_event(client: &mut Client, event_name: &str) -> Value {
    let wait = async {
        while let Some(message) = client.next().await {
            if let Message::Text(text) = message.unwrap() {
                let event: Value = serde_json::from_str(&text).unwrap();
                if event["eventName"] == event_name {
                    return event;
                }
            }
        }
        panic!("connection closed before {event_name}");
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
}

/// Read `event_name` events until one carries `count`.
async fn expect_count(client: &mut Client, event_name: &str, count: u64) {
    loop {
        let event = expect_event(client, event_name).await;
        if event["data"] == count {
            return;
        }
    }
}

#[tokio::test]
async fn broadcast_crosses_servers() {
    let bus = LocalBusHub::new();
    let (addr_a, stop_a, task_a) = spawn_server(&bus).await;
    let (addr_b, stop_b, task_b) = spawn_server(&bus).await;

    let mut alice = connect(addr_a).await;
    let mut bob = connect(addr_b).await;

    send(&mut alice, json!({"eventName": "join", "data": {"room": "booyaroom"}, "requestToken": 1}))
        .await;
    send(&mut bob, json!({"eventName": "join", "data": {"room": "booyaroom"}, "requestToken": 2}))
        .await;
    assert_eq!(expect_event(&mut alice, "response-1").await["result"], json!({"ok": true}));
    assert_eq!(expect_event(&mut bob, "response-2").await["result"], json!({"ok": true}));

    send(
        &mut alice,
        json!({
            "eventName": "broadcast",
            "data": {"room": "booyaroom", "eventName": "ape", "data": {"booya": "man"}},
        }),
    )
    .await;

    assert_eq!(expect_event(&mut alice, "ape").await["data"], json!({"booya": "man"}));
    assert_eq!(expect_event(&mut bob, "ape").await["data"], json!({"booya": "man"}));

    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    task_a.await.unwrap();
    task_b.await.unwrap();
}

#[tokio::test]
async fn presence_counts_across_servers_and_disconnects() {
    let bus = LocalBusHub::new();
    let (addr_a, stop_a, task_a) = spawn_server(&bus).await;
    let (addr_b, stop_b, task_b) = spawn_server(&bus).await;

    let mut watcher = connect(addr_a).await;
    send(&mut watcher, json!({"eventName": "presence", "data": {"room": "lobby", "key": "n"}}))
        .await;
    expect_count(&mut watcher, "n", 0).await;

    let mut local = connect(addr_a).await;
    let mut remote = connect(addr_b).await;
    send(&mut local, json!({"eventName": "join", "data": {"room": "lobby"}})).await;
    send(&mut remote, json!({"eventName": "join", "data": {"room": "lobby"}})).await;
    expect_count(&mut watcher, "n", 2).await;

    remote.close(None).await.unwrap();
    expect_count(&mut watcher, "n", 1).await;

    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    task_a.await.unwrap();
    task_b.await.unwrap();
}
