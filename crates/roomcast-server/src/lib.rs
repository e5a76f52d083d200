//! Roomcast production server.
//!
//! Production gateway using tokio for the async runtime, tokio-tungstenite
//! for WebSockets, and system time with OS randomness.
//!
//! # Architecture
//!
//! This crate provides production "glue" around [`roomcast_core`]'s
//! action-based state machines. The [`HubDriver`] follows the Sans-IO pattern
//! (see [`roomcast_core`]); [`Server`] executes its actions against real
//! sockets and a bus.
//!
//! ```text
//!  conn task ─┐ HubEvent                    HubAction::Bus
//!  conn task ─┼──────────► hub task ──────────────────────► Bus
//!  bus inbox ─┘           (HubDriver)  ◄──── bus messages ──┘
//!                             │
//!                             └── WsConnection::send ──► writer task ──► socket
//! ```
//!
//! # Components
//!
//! - [`HubDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`Server`]: production runtime that executes hub actions
//! - [`WsConnection`]: WebSocket transport handle
//! - [`LocalBus`]: in-process bus shared by hubs in one process
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod demo;
mod driver;
mod error;
mod hub_error;
mod socket;
mod system_env;
mod transport;

use std::{collections::HashMap, future::Future, net::SocketAddr};

pub use bus::{BusInbox, LocalBus, LocalBusHub};
pub use demo::{DemoError, install_demo_protocol};
pub use driver::{HubAction, HubConfig, HubDriver, HubEvent};
pub use error::ServerError;
use futures_util::{SinkExt, StreamExt};
pub use hub_error::HubError;
use roomcast_core::{ConnectionId, ControlEvent, Transport};
pub use socket::{
    Command, CommandSender, ConnectionHandler, Flow, Middleware, Scope, Socket, SocketHandle,
};
pub use system_env::SystemEnv;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::Message;
pub use transport::WsConnection;

type Hub = HubDriver<SystemEnv, WsConnection>;
type EventSender = mpsc::UnboundedSender<HubEvent<WsConnection>>;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Hub configuration (channel prefix, presence, limits)
    pub hub: HubConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0:8080".to_string(), hub: HubConfig::default() }
    }
}

/// Production roomcast server.
///
/// Wraps [`HubDriver`] with a WebSocket listener and a bus endpoint.
pub struct Server {
    /// The action-based hub driver
    hub: Hub,
    /// TCP listener for WebSocket upgrades
    listener: TcpListener,
    /// Outbound bus endpoint
    bus: LocalBus,
    /// Inbound bus messages
    inbox: BusInbox,
}

impl Server {
    /// Create and bind a server with a private in-process bus.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        Self::bind_with_bus(config, &LocalBusHub::new()).await
    }

    /// Create and bind a server attached to a shared in-process bus.
    ///
    /// Servers on the same [`LocalBusHub`] see each other's broadcasts and
    /// presence counts.
    pub async fn bind_with_bus(
        config: ServerRuntimeConfig,
        bus_hub: &LocalBusHub,
    ) -> Result<Self, ServerError> {
        config.hub.validate()?;
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ServerError::Config(format!("invalid bind address '{}': {e}", config.bind_address))
        })?;
        let listener = TcpListener::bind(addr).await?;
        let (bus, inbox) = bus_hub.connect();
        let hub = HubDriver::new(SystemEnv::new(), config.hub);

        tracing::info!("WebSocket listener bound to {}", addr);
        Ok(Self { hub, listener, bus, inbox })
    }

    /// Hub driver, for installing middleware and handlers before [`Self::run`].
    pub fn hub_mut(&mut self) -> &mut HubDriver<SystemEnv, WsConnection> {
        &mut self.hub
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Signal handler error: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes, then announce presence shutdown.
    ///
    /// Each wake-up drains every event that is already queued, then runs one
    /// scheduling pass, so bursts of joins coalesce into one notification.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self { mut hub, listener, bus, mut inbox } = self;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connections: HashMap<ConnectionId, WsConnection> = HashMap::new();
        let mut next_connection = 0u64;

        tracing::info!("Server starting on {}", listener.local_addr()?);
        let actions = hub.start();
        execute_actions(actions, &bus, &connections);

        tokio::pin!(shutdown);
        loop {
            let wake = hub.next_deadline().map(tokio::time::Instant::from_std);

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_connection += 1;
                        let connection = ConnectionId(next_connection);
                        let events = events_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(connection, stream, peer, events).await {
                                tracing::debug!("Connection error: {}", e);
                            }
                        });
                    },
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                Some(event) = events_rx.recv() => {
                    dispatch(&mut hub, event, &bus, &mut connections);
                    while let Ok(event) = events_rx.try_recv() {
                        dispatch(&mut hub, event, &bus, &mut connections);
                    }
                },
                Some((channel, payload)) = inbox.recv() => {
                    dispatch(&mut hub, HubEvent::BusMessage { channel, payload }, &bus, &mut connections);
                    while let Ok((channel, payload)) = inbox.try_recv() {
                        let event = HubEvent::BusMessage { channel, payload };
                        dispatch(&mut hub, event, &bus, &mut connections);
                    }
                },
                () = sleep_until(wake) => {},
                () = &mut shutdown => break,
            }

            dispatch(&mut hub, HubEvent::Tick, &bus, &mut connections);
        }

        tracing::info!("Server shutting down");
        let actions = hub.shutdown();
        execute_actions(actions, &bus, &connections);
        for connection in connections.values() {
            connection.close();
        }
        Ok(())
    }
}

async fn sleep_until(wake: Option<tokio::time::Instant>) {
    match wake {
        Some(wake) => tokio::time::sleep_until(wake).await,
        None => std::future::pending().await,
    }
}

/// Feed one event to the hub and execute the resulting actions.
fn dispatch(
    hub: &mut Hub,
    event: HubEvent<WsConnection>,
    bus: &LocalBus,
    connections: &mut HashMap<ConnectionId, WsConnection>,
) {
    let closed = match &event {
        HubEvent::ConnectionAccepted { connection, transport } => {
            connections.insert(*connection, transport.clone());
            None
        },
        HubEvent::ConnectionError { connection, error } => {
            if let Some(transport) = connections.get(connection) {
                transport.fire(ControlEvent::Error, Some(error));
            }
            None
        },
        HubEvent::ConnectionClosed { connection, reason } => {
            if let Some(transport) = connections.get(connection) {
                transport.fire(ControlEvent::Close, Some(reason));
            }
            Some(*connection)
        },
        _ => None,
    };

    match hub.process_event(event) {
        Ok(actions) => execute_actions(actions, bus, connections),
        Err(e) => tracing::debug!("Hub error: {}", e),
    }

    if let Some(connection) = closed {
        connections.remove(&connection);
    }
}

/// Execute hub actions.
fn execute_actions(
    actions: Vec<HubAction>,
    bus: &LocalBus,
    connections: &HashMap<ConnectionId, WsConnection>,
) {
    for action in actions {
        match action {
            HubAction::Bus(action) => action.apply(bus),
            HubAction::Close { connection, reason } => {
                tracing::debug!(%connection, %reason, "closing connection");
                if let Some(transport) = connections.get(&connection) {
                    transport.close();
                }
            },
        }
    }
}

/// Handle a single WebSocket connection.
///
/// Performs the upgrade, spawns the writer, and forwards inbound text frames
/// to the hub until the socket ends.
async fn handle_connection(
    connection: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: EventSender,
) -> Result<(), ServerError> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::Transport(format!("handshake with {peer} failed: {e}")))?;
    let (mut sink, mut source) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let transport = WsConnection::new(connection, outbound_tx);

    tracing::debug!(%connection, %peer, "new connection");
    events
        .send(HubEvent::ConnectionAccepted { connection, transport })
        .map_err(|_| ServerError::Internal("hub task gone".to_string()))?;

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                tracing::trace!(%connection, "write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut reason = "peer closed".to_string();
    while let Some(message) = source.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::trace!(%connection, "dropping non-UTF-8 binary frame");
                    continue;
                },
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    reason = frame.reason.to_string();
                }
                break;
            },
            Ok(_) => continue,
            Err(e) => {
                reason = e.to_string();
                let error = reason.clone();
                let _ = events.send(HubEvent::ConnectionError { connection, error });
                break;
            },
        };

        if events.send(HubEvent::FrameReceived { connection, frame }).is_err() {
            break;
        }
    }

    // Hub gone means shutdown already dropped this connection.
    let _ = events.send(HubEvent::ConnectionClosed { connection, reason });
    Ok(())
}
