//! Hub driver.
//!
//! Ties together one [`Multiplexer`] per connection, the [`RoomRegistry`]
//! (broadcast membership) and the optional [`PresenceCoordinator`]
//! (participant counts). Like the components it composes, the driver performs
//! no I/O of its own beyond fire-and-forget writes on connection transports:
//! bus traffic and connection closes leave as [`HubAction`]s.

use std::{collections::HashMap, sync::Arc};

use roomcast_core::{
    BusAction, ConnectionId, Environment, Multiplexer, PresenceConfig, PresenceCoordinator,
    PresenceSubscription, RegistryAction, RegistryConfig, RoomRegistry, Transport,
    presence::CHANNEL_PREFIX,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::ServerError,
    hub_error::HubError,
    socket::{
        Command, CommandSender, ConnectionHandler, Flow, Middleware, Scope, Socket, SocketHandle,
    },
};

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Room registry configuration (channel prefix)
    pub registry: RegistryConfig,
    /// Presence protocol configuration; `None` disables presence
    pub presence: Option<PresenceConfig>,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            presence: Some(PresenceConfig::default()),
            max_connections: 10_000,
        }
    }
}

impl HubConfig {
    /// Check the configuration before a hub is built from it.
    ///
    /// Bus channels starting with the presence prefix are routed to presence,
    /// so a room channel prefix that overlaps it in either direction would
    /// lose room broadcasts.
    pub fn validate(&self) -> Result<(), ServerError> {
        let prefix = self.registry.channel_prefix.as_str();
        if prefix.starts_with(CHANNEL_PREFIX) || CHANNEL_PREFIX.starts_with(prefix) {
            return Err(ServerError::Config(format!(
                "channel prefix '{prefix}' overlaps the presence prefix '{CHANNEL_PREFIX}'"
            )));
        }
        if self.presence.as_ref().is_some_and(|p| p.heartbeat_interval.is_zero()) {
            return Err(ServerError::Config("heartbeat interval must not be zero".to_string()));
        }
        Ok(())
    }
}

/// Events that the hub driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug)]
pub enum HubEvent<T> {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        connection: ConnectionId,
        /// Handle for writing to and closing the connection
        transport: T,
    },

    /// A text frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        connection: ConnectionId,
        /// Raw frame text
        frame: String,
    },

    /// A connection failed. A [`HubEvent::ConnectionClosed`] follows.
    ConnectionError {
        /// Connection that failed
        connection: ConnectionId,
        /// Error text
        error: String,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        connection: ConnectionId,
        /// Reason for closure
        reason: String,
    },

    /// A message arrived from the bus
    BusMessage {
        /// Channel it arrived on
        channel: String,
        /// Raw payload
        payload: String,
    },

    /// A command queued outside any handler
    Command(Command),

    /// Scheduling pass: run batches and timers that are due
    Tick,
}

/// Actions that the hub driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubAction {
    /// Execute an operation on the bus
    Bus(BusAction),

    /// Close a connection
    Close {
        /// Connection to close
        connection: ConnectionId,
        /// Reason for closure
        reason: String,
    },
}

impl From<BusAction> for HubAction {
    fn from(action: BusAction) -> Self {
        Self::Bus(action)
    }
}

/// Per-connection side table.
struct ConnectionState<T> {
    mux: Multiplexer<T>,
    handle: SocketHandle,
    /// (room, key) → presence subscription
    presence: HashMap<(String, String), PresenceSubscription>,
}

/// Action-based hub driver.
///
/// Orchestrates connection setup, room membership and presence.
pub struct HubDriver<E, T>
where
    E: Environment,
{
    /// Live connections
    connections: HashMap<ConnectionId, ConnectionState<T>>,
    /// Broadcast membership
    registry: RoomRegistry,
    /// Participant counts, when enabled
    presence: Option<PresenceCoordinator<E::Instant>>,
    middleware: Vec<Middleware<T>>,
    on_connection: Option<ConnectionHandler<T>>,
    commands_tx: CommandSender,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    started: bool,
    /// Environment (time, RNG)
    env: E,
    /// Hub configuration
    config: HubConfig,
}

impl<E, T> HubDriver<E, T>
where
    E: Environment,
    T: Transport,
{
    /// Create a new hub driver.
    pub fn new(env: E, config: HubConfig) -> Self {
        let registry = RoomRegistry::new(&env, config.registry.clone());
        let presence =
            config.presence.clone().map(|presence| PresenceCoordinator::new(&env, presence));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            registry,
            presence,
            middleware: Vec::new(),
            on_connection: None,
            commands_tx,
            commands_rx,
            started: false,
            env,
            config,
        }
    }

    /// Append a middleware step.
    ///
    /// Middleware runs once per new connection, in registration order, after
    /// the built-in setup. Returning [`Flow::Halt`] ends the chain.
    pub fn use_middleware<F>(&mut self, middleware: F)
    where
        F: FnMut(&mut Socket<'_, T>) -> Flow + Send + 'static,
    {
        self.middleware.push(Box::new(middleware));
    }

    /// Set the handler run for each connection that passes all middleware.
    pub fn on_connection<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Socket<'_, T>) + Send + 'static,
    {
        self.on_connection = Some(Box::new(handler));
    }

    /// Sender for queuing commands from outside a handler.
    pub fn command_sender(&self) -> CommandSender {
        self.commands_tx.clone()
    }

    /// Attach the bus and announce presence.
    pub fn start(&mut self) -> Vec<HubAction> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        let now = self.env.now();
        let attached = self.registry.attach_bus();
        let mut actions = self.apply_registry(attached);
        if let Some(presence) = &mut self.presence {
            actions.extend(presence.connect(now).into_iter().map(HubAction::Bus));
        }
        tracing::info!(instance = %self.registry.id(), "hub started");
        actions
    }

    /// Announce presence shutdown to peers.
    pub fn shutdown(&mut self) -> Vec<HubAction> {
        let actions: Vec<HubAction> = self
            .presence
            .as_mut()
            .map(|presence| presence.disconnect().into_iter().map(HubAction::Bus).collect())
            .unwrap_or_default();
        tracing::info!(instance = %self.registry.id(), "hub shut down");
        actions
    }

    /// Process a hub event and return actions to execute.
    ///
    /// This is the main entry point for the hub driver. Commands queued by
    /// handlers while processing the event are applied before returning.
    pub fn process_event(&mut self, event: HubEvent<T>) -> Result<Vec<HubAction>, HubError> {
        let mut actions = match event {
            HubEvent::ConnectionAccepted { connection, transport } => {
                self.handle_connection_accepted(connection, transport)?
            },
            HubEvent::FrameReceived { connection, frame } => {
                self.handle_frame_received(connection, &frame)?
            },
            HubEvent::ConnectionError { connection, error } => {
                tracing::debug!(%connection, %error, "connection error");
                Vec::new()
            },
            HubEvent::ConnectionClosed { connection, reason } => {
                tracing::debug!(%connection, %reason, "connection closed");
                self.cleanup(connection)
            },
            HubEvent::BusMessage { channel, payload } => {
                self.handle_bus_message(&channel, &payload)
            },
            HubEvent::Command(command) => self.apply(command),
            HubEvent::Tick => self.handle_tick(),
        };

        self.drain_commands(&mut actions);
        Ok(actions)
    }

    /// Broadcast to every member of `room` on every instance.
    pub fn broadcast(&mut self, room: &str, event_name: &str, data: Value) -> Vec<HubAction> {
        let actions = self.registry.broadcast(room, event_name, data);
        self.apply_registry(actions)
    }

    /// Earliest instant at which a [`HubEvent::Tick`] has work.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        self.presence.as_ref().and_then(PresenceCoordinator::next_deadline)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether `connection` is live.
    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    /// Room registry.
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Presence coordinator, if enabled.
    pub fn presence(&self) -> Option<&PresenceCoordinator<E::Instant>> {
        self.presence.as_ref()
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn handle_connection_accepted(
        &mut self,
        connection: ConnectionId,
        transport: T,
    ) -> Result<Vec<HubAction>, HubError> {
        if self.connections.contains_key(&connection) {
            return Err(HubError::DuplicateConnection(connection));
        }

        if self.connections.len() >= self.config.max_connections {
            tracing::warn!(%connection, limit = self.config.max_connections, "connection refused");
            return Ok(vec![HubAction::Close {
                connection,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        let mut mux = Multiplexer::new(connection, transport);
        let handle = SocketHandle::new(connection, self.commands_tx.clone());

        let mut socket = Socket::new(&mut mux, handle.clone());
        let mut halted = false;
        for middleware in &mut self.middleware {
            if middleware(&mut socket) == Flow::Halt {
                halted = true;
                break;
            }
        }
        if halted {
            tracing::debug!(%connection, "middleware halted setup");
        } else if let Some(handler) = &mut self.on_connection {
            handler(&mut socket);
        }

        self.connections
            .insert(connection, ConnectionState { mux, handle, presence: HashMap::new() });
        tracing::debug!(%connection, live = self.connections.len(), "connection accepted");
        Ok(Vec::new())
    }

    fn handle_frame_received(
        &mut self,
        connection: ConnectionId,
        frame: &str,
    ) -> Result<Vec<HubAction>, HubError> {
        let state = self
            .connections
            .get_mut(&connection)
            .ok_or(HubError::UnknownConnection(connection))?;
        state.mux.handle_frame(frame);
        Ok(Vec::new())
    }

    fn handle_bus_message(&mut self, channel: &str, payload: &str) -> Vec<HubAction> {
        if channel.starts_with(CHANNEL_PREFIX) {
            let now = self.env.now();
            return self
                .presence
                .as_mut()
                .map(|presence| {
                    let actions = presence.handle_bus_message(channel, payload, now);
                    actions.into_iter().map(HubAction::Bus).collect()
                })
                .unwrap_or_default();
        }

        let actions = self.registry.handle_bus_message(channel, payload);
        self.apply_registry(actions)
    }

    fn handle_tick(&mut self) -> Vec<HubAction> {
        let now = self.env.now();
        self.presence
            .as_mut()
            .map(|presence| presence.poll(now).into_iter().map(HubAction::Bus).collect())
            .unwrap_or_default()
    }

    fn drain_commands(&mut self, actions: &mut Vec<HubAction>) {
        while let Ok(command) = self.commands_rx.try_recv() {
            actions.extend(self.apply(command));
        }
    }

    /// Apply one queued command.
    ///
    /// Commands for connections that are already gone are dropped, so a
    /// handle outliving its connection cannot resurrect memberships.
    fn apply(&mut self, command: Command) -> Vec<HubAction> {
        let now = self.env.now();

        match command {
            Command::Join { connection, room, scope } => {
                if !self.has_connection(connection) {
                    return Vec::new();
                }
                let mut actions = Vec::new();
                if scope.rooms() {
                    let joined = self.registry.join(connection, &room);
                    actions = self.apply_registry(joined);
                }
                if scope.presence()
                    && let Some(presence) = &mut self.presence
                {
                    presence.join(connection, &room, now);
                }
                actions
            },
            Command::Leave { connection, room, scope } => {
                if !self.has_connection(connection) {
                    return Vec::new();
                }
                let mut actions = Vec::new();
                if scope.rooms() {
                    let left = self.registry.leave(connection, &room);
                    actions = self.apply_registry(left);
                }
                if scope.presence()
                    && let Some(presence) = &mut self.presence
                {
                    presence.leave(connection, &room, now);
                }
                actions
            },
            Command::LeaveAll { connection, scope } => {
                if !self.has_connection(connection) {
                    return Vec::new();
                }
                self.leave_all(connection, scope, now)
            },
            Command::Broadcast { room, event_name, data } => {
                self.broadcast(&room, &event_name, data)
            },
            Command::SubscribePresence { connection, room, key } => {
                self.subscribe_presence(connection, room, key);
                Vec::new()
            },
            Command::UnsubscribePresence { connection, room, key } => {
                let subscription = self
                    .connections
                    .get_mut(&connection)
                    .and_then(|state| state.presence.remove(&(room, key)));
                if let (Some(subscription), Some(presence)) = (subscription, &mut self.presence) {
                    presence.unsubscribe(&subscription);
                }
                Vec::new()
            },
            Command::Emit { connection, event_name, data } => {
                self.deliver(connection, &event_name, data);
                Vec::new()
            },
            Command::Close { connection } => {
                if !self.has_connection(connection) {
                    return Vec::new();
                }
                vec![HubAction::Close { connection, reason: "closed by server".to_string() }]
            },
        }
    }

    fn leave_all(
        &mut self,
        connection: ConnectionId,
        scope: Scope,
        now: E::Instant,
    ) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if scope.rooms() {
            let left = self.registry.leave_all(connection);
            actions = self.apply_registry(left);
        }
        if scope.presence()
            && let Some(presence) = &mut self.presence
        {
            presence.leave_all(connection, now);
        }
        actions
    }

    fn subscribe_presence(&mut self, connection: ConnectionId, room: String, key: String) {
        let Some(presence) = &mut self.presence else {
            tracing::debug!(%connection, %room, "presence disabled, subscription ignored");
            return;
        };
        let Some(state) = self.connections.get_mut(&connection) else {
            return;
        };
        let slot = (room, key);
        if state.presence.contains_key(&slot) {
            return;
        }

        let handle = state.handle.clone();
        let event_name = slot.1.clone();
        let subscription = presence.subscribe(
            &slot.0,
            Arc::new(move |count| handle.emit(&event_name, Value::from(count))),
            true,
        );
        state.presence.insert(slot, subscription);
    }

    /// Detach a closed connection from every component. Runs once.
    fn cleanup(&mut self, connection: ConnectionId) -> Vec<HubAction> {
        let Some(mut state) = self.connections.remove(&connection) else {
            return Vec::new();
        };
        if !state.mux.handle_close() {
            return Vec::new();
        }

        if let Some(presence) = &mut self.presence {
            for subscription in state.presence.values() {
                presence.unsubscribe(subscription);
            }
        }
        let now = self.env.now();
        let actions = self.leave_all(connection, Scope::Both, now);
        tracing::debug!(%connection, live = self.connections.len(), "connection cleaned up");
        actions
    }

    fn deliver(&self, connection: ConnectionId, event_name: &str, data: Value) {
        let Some(state) = self.connections.get(&connection) else {
            tracing::trace!(%connection, event = event_name, "deliver to unknown connection");
            return;
        };
        if let Err(err) = state.mux.publish(event_name, data) {
            tracing::warn!(%connection, %err, "event not delivered");
        }
    }

    fn apply_registry(&self, actions: Vec<RegistryAction>) -> Vec<HubAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                RegistryAction::Bus(bus) => out.push(HubAction::Bus(bus)),
                RegistryAction::Deliver { connection, event_name, data } => {
                    self.deliver(connection, &event_name, data);
                },
            }
        }
        out
    }
}
