//! Server driver.
//!
//! Ties together the connection gateway (authentication), membership
//! authority (authorization), connection registry (trip-room subscription),
//! message log (ordered persistence), and storage. Pure event-to-action
//! logic; the runtime in `lib.rs` executes the actions.
//!
//! All shared state is mutated here, inside one driver instance that the
//! runtime guards with a single lock. That is what serializes concurrent
//! sends into one commit order per trip and lets room membership live in
//! plain maps without further locking.

use std::collections::HashMap;

use tripline_core::{
    Identity,
    connection::{Connection, ConnectionAction, ConnectionConfig},
    env::Environment,
};
use tripline_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{
        ErrorPayload,
        chat::{HistoryResponse, MAX_BODY_LEN, NewMessage, PostAck, RegisterAck},
        session::HelloAck,
    },
};

use crate::{
    gateway::ConnectionGateway,
    membership::{self, MembershipError},
    message_log::MessageLog,
    registry::{ConnectionRegistry, SessionInfo},
    server_error::ServerError,
    storage::Storage,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (handshake and idle timeouts)
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Upper bound on messages per history page
    pub history_page_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 10_000,
            history_page_limit: 200,
        }
    }
}

/// Events the server driver processes.
///
/// Produced by the external runtime (production transport or tests).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection id assigned by the runtime
        session_id: u64,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        session_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for timeout checking
    Tick,
}

/// Actions the server driver produces.
///
/// Executed in order by runtime-specific code. Ordering matters: by the
/// time a `BroadcastToTrip` is emitted, the message it carries is already
/// durably committed (persistence happens inside the driver, never as a
/// deferred action).
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Send a frame to a specific session
    SendToSession {
        /// Target session id
        session_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Broadcast a frame to every session in a trip room, the original
    /// sender included: the sender resolves its optimistic copy against
    /// its own echo.
    BroadcastToTrip {
        /// Target trip room
        trip_id: u64,
        /// Frame to broadcast
        frame: Frame,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Log a message
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Log levels for server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based server driver.
///
/// Orchestrates authentication, authorization, persistence, and fan-out.
pub struct ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Connection state machines (session_id → Connection)
    connections: HashMap<u64, Connection<E::Instant>>,
    /// Session/room registry
    registry: ConnectionRegistry,
    /// Handshake authentication
    gateway: ConnectionGateway,
    /// Per-trip message sequencing
    message_log: MessageLog,
    /// Storage backend
    storage: S,
    /// Environment (time, RNG)
    env: E,
    /// Server configuration
    config: ServerConfig,
}

impl<E, S> ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Create a new server driver.
    pub fn new(env: E, storage: S, gateway: ConnectionGateway, config: ServerConfig) -> Self {
        Self {
            connections: HashMap::new(),
            registry: ConnectionRegistry::new(),
            gateway,
            message_log: MessageLog::new(),
            storage,
            env,
            config,
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                self.handle_connection_accepted(session_id)
            },
            ServerEvent::FrameReceived { session_id, frame } => {
                self.handle_frame_received(session_id, frame)
            },
            ServerEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.handle_connection_closed(session_id, &reason))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    /// Handle a new connection being accepted.
    fn handle_connection_accepted(
        &mut self,
        session_id: u64,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();

        if self.connections.len() >= self.config.max_connections {
            return Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        self.connections.insert(session_id, Connection::new(now, self.config.connection.clone()));
        self.registry.register_session(session_id, SessionInfo::new());

        Ok(vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection accepted, session_id={session_id}"),
        }])
    }

    /// Handle a frame received from a connection.
    fn handle_frame_received(
        &mut self,
        session_id: u64,
        frame: Frame,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();

        let conn = self
            .connections
            .get_mut(&session_id)
            .ok_or(ServerError::SessionNotFound(session_id))?;
        conn.update_activity(now);

        let Some(opcode) = frame.header.opcode_enum() else {
            return Ok(self.refuse(
                session_id,
                ErrorPayload::protocol(format!("unrecognized opcode {:#06x}", frame.header.opcode())),
                "protocol violation",
            ));
        };

        if opcode == Opcode::Hello {
            return Ok(self.handle_hello(session_id, &frame));
        }

        if opcode == Opcode::Goodbye {
            return Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "goodbye".to_string(),
            }]);
        }

        // No event is processed before authentication succeeds.
        let Some(identity) = self.registry.session(session_id).and_then(|s| s.identity.clone())
        else {
            return Ok(self.refuse(
                session_id,
                ErrorPayload::authentication("connection is not authenticated"),
                "unauthenticated",
            ));
        };

        match opcode {
            Opcode::JoinTrip => Ok(self.handle_join(session_id, &identity, &frame)),
            Opcode::LeaveTrip => Ok(self.handle_leave(session_id, &frame)),
            Opcode::SendMessage => Ok(self.handle_send(session_id, &identity, &frame)),
            Opcode::HistoryRequest => Ok(self.handle_history(session_id, &identity, &frame)),
            Opcode::PostMessage => Ok(self.handle_post(session_id, &identity, &frame)),
            Opcode::RegisterParticipant => Ok(self.handle_register(session_id, &identity, &frame)),
            _ => Ok(self.refuse(
                session_id,
                ErrorPayload::protocol(format!("unexpected opcode {opcode:?} from client")),
                "protocol violation",
            )),
        }
    }

    /// Handle the authentication handshake.
    fn handle_hello(&mut self, session_id: u64, frame: &Frame) -> Vec<ServerAction> {
        let hello = match Payload::from_frame(frame) {
            Ok(Payload::Hello(hello)) => hello,
            Ok(_) | Err(_) => {
                return self.refuse(
                    session_id,
                    ErrorPayload::authentication("malformed handshake payload"),
                    "authentication failed",
                );
            },
        };

        match self.gateway.authenticate(&hello, self.env.wall_clock_secs(), &self.storage) {
            Ok(identity) => {
                if let Some(conn) = self.connections.get_mut(&session_id) {
                    conn.mark_ready(self.env.now());
                }
                self.registry.authenticate_session(session_id, identity.clone());

                let ack = Payload::HelloAck(HelloAck {
                    user_id: identity.user_id,
                    display_name: identity.display_name.clone(),
                });

                let mut actions = match ack.into_frame(FrameHeader::new(Opcode::HelloAck)) {
                    Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }],
                    Err(e) => vec![encode_failure_log(&e)],
                };
                actions.push(ServerAction::Log {
                    level: LogLevel::Info,
                    message: format!(
                        "session {session_id} authenticated as user {} ({})",
                        identity.user_id, identity.display_name
                    ),
                });
                actions
            },
            Err(err) => self.refuse(
                session_id,
                ErrorPayload::authentication(err.to_string()),
                "authentication failed",
            ),
        }
    }

    /// Handle a room join request.
    fn handle_join(
        &mut self,
        session_id: u64,
        identity: &Identity,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();

        match membership::is_member(&self.storage, trip_id, identity.user_id) {
            Ok(true) => {
                self.registry.subscribe(session_id, trip_id);
                vec![ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!(
                        "session {session_id} (user {}) joined trip {trip_id}",
                        identity.user_id
                    ),
                }]
            },
            Ok(false) => self.error_to_session(
                session_id,
                trip_id,
                0,
                ErrorPayload::authorization(format!(
                    "user {} is not a member of trip {trip_id}",
                    identity.user_id
                )),
            ),
            Err(err) => self.membership_error_to_session(session_id, trip_id, 0, &err),
        }
    }

    /// Handle an explicit room leave. Mutates only the in-memory member
    /// set; there is no persisted side effect.
    fn handle_leave(&mut self, session_id: u64, frame: &Frame) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();
        self.registry.unsubscribe(session_id, trip_id);

        vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("session {session_id} left trip {trip_id}"),
        }]
    }

    /// Handle a live send: validate, re-authorize, persist, then fan out.
    fn handle_send(
        &mut self,
        session_id: u64,
        identity: &Identity,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();
        let correlation_id = frame.header.correlation_id();

        let send = match Payload::from_frame(frame) {
            Ok(Payload::SendMessage(send)) => send,
            Ok(_) | Err(_) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::validation("malformed SendMessage payload"),
                );
            },
        };

        let body = send.body.trim();
        if body.is_empty() {
            return self.error_to_session(
                session_id,
                trip_id,
                correlation_id,
                ErrorPayload::validation("message body is empty"),
            );
        }
        if body.len() > MAX_BODY_LEN {
            return self.error_to_session(
                session_id,
                trip_id,
                correlation_id,
                ErrorPayload::validation(format!("message body exceeds {MAX_BODY_LEN} bytes")),
            );
        }

        // Fresh check, independent of join-time authorization: membership
        // can change mid-session.
        match membership::is_member(&self.storage, trip_id, identity.user_id) {
            Ok(true) => {},
            Ok(false) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::authorization(format!(
                        "user {} is not a member of trip {trip_id}",
                        identity.user_id
                    )),
                );
            },
            Err(err) => {
                return self.membership_error_to_session(session_id, trip_id, correlation_id, &err);
            },
        }

        // Durably committed before any broadcast action exists.
        let message = match self.message_log.append(
            trip_id,
            identity,
            body.to_string(),
            self.env.wall_clock_millis(),
            &self.storage,
        ) {
            Ok(message) => message,
            Err(err) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::storage(err.to_string()),
                );
            },
        };

        let mut header = FrameHeader::new(Opcode::NewMessage);
        header.set_trip_id(trip_id);
        header.set_sender_id(message.author_id);
        header.set_message_id(message.id);
        header.set_timestamp_ms(message.created_at_ms);
        header.set_correlation_id(correlation_id);

        let message_id = message.id;
        match Payload::NewMessage(NewMessage { message }).into_frame(header) {
            Ok(frame) => vec![
                ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!("message {message_id} committed to trip {trip_id}"),
                },
                ServerAction::BroadcastToTrip { trip_id, frame },
            ],
            Err(e) => vec![encode_failure_log(&e)],
        }
    }

    /// Handle a history page request.
    fn handle_history(
        &mut self,
        session_id: u64,
        identity: &Identity,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();

        let request = match Payload::from_frame(frame) {
            Ok(Payload::HistoryRequest(request)) => request,
            Ok(_) | Err(_) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    0,
                    ErrorPayload::validation("malformed HistoryRequest payload"),
                );
            },
        };

        match membership::is_member(&self.storage, trip_id, identity.user_id) {
            Ok(true) => {},
            Ok(false) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    0,
                    ErrorPayload::authorization(format!(
                        "user {} is not a member of trip {trip_id}",
                        identity.user_id
                    )),
                );
            },
            Err(err) => return self.membership_error_to_session(session_id, trip_id, 0, &err),
        }

        let from_id = request.from_id.max(1);
        let limit = (request.limit as usize).clamp(1, self.config.history_page_limit);

        let messages = match self.storage.load_messages(trip_id, from_id, limit) {
            Ok(messages) => messages,
            Err(err) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    0,
                    ErrorPayload::storage(err.to_string()),
                );
            },
        };

        let has_more = match self.storage.latest_message_id(trip_id) {
            Ok(latest) => match (messages.last(), latest) {
                (Some(newest), Some(latest)) => newest.id < latest,
                _ => false,
            },
            Err(err) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    0,
                    ErrorPayload::storage(err.to_string()),
                );
            },
        };

        let response = Payload::HistoryResponse(HistoryResponse { messages, has_more });
        let mut header = FrameHeader::new(Opcode::HistoryResponse);
        header.set_trip_id(trip_id);

        match response.into_frame(header) {
            Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }],
            Err(e) => vec![encode_failure_log(&e)],
        }
    }

    /// Handle the no-live-connection fallback: persist and ack, no
    /// broadcast.
    fn handle_post(
        &mut self,
        session_id: u64,
        identity: &Identity,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();
        let correlation_id = frame.header.correlation_id();

        let post = match Payload::from_frame(frame) {
            Ok(Payload::PostMessage(post)) => post,
            Ok(_) | Err(_) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::validation("malformed PostMessage payload"),
                );
            },
        };

        let body = post.body.trim();
        if body.is_empty() {
            return self.error_to_session(
                session_id,
                trip_id,
                correlation_id,
                ErrorPayload::validation("message body is empty"),
            );
        }
        if body.len() > MAX_BODY_LEN {
            return self.error_to_session(
                session_id,
                trip_id,
                correlation_id,
                ErrorPayload::validation(format!("message body exceeds {MAX_BODY_LEN} bytes")),
            );
        }

        match membership::is_member(&self.storage, trip_id, identity.user_id) {
            Ok(true) => {},
            Ok(false) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::authorization(format!(
                        "user {} is not a member of trip {trip_id}",
                        identity.user_id
                    )),
                );
            },
            Err(err) => {
                return self.membership_error_to_session(session_id, trip_id, correlation_id, &err);
            },
        }

        let message = match self.message_log.append(
            trip_id,
            identity,
            body.to_string(),
            self.env.wall_clock_millis(),
            &self.storage,
        ) {
            Ok(message) => message,
            Err(err) => {
                return self.error_to_session(
                    session_id,
                    trip_id,
                    correlation_id,
                    ErrorPayload::storage(err.to_string()),
                );
            },
        };

        let mut header = FrameHeader::new(Opcode::PostAck);
        header.set_trip_id(trip_id);
        header.set_message_id(message.id);
        header.set_timestamp_ms(message.created_at_ms);
        header.set_correlation_id(correlation_id);

        match Payload::PostAck(PostAck { message }).into_frame(header) {
            Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }],
            Err(e) => vec![encode_failure_log(&e)],
        }
    }

    /// Handle a participant registration.
    fn handle_register(
        &mut self,
        session_id: u64,
        identity: &Identity,
        frame: &Frame,
    ) -> Vec<ServerAction> {
        let trip_id = frame.header.trip_id();

        match membership::register_participant(
            &self.storage,
            trip_id,
            identity,
            self.env.wall_clock_secs(),
        ) {
            Ok(created) => {
                let ack = Payload::RegisterAck(RegisterAck { created });
                let mut header = FrameHeader::new(Opcode::RegisterAck);
                header.set_trip_id(trip_id);

                let mut actions = match ack.into_frame(header) {
                    Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }],
                    Err(e) => vec![encode_failure_log(&e)],
                };
                if created {
                    actions.push(ServerAction::Log {
                        level: LogLevel::Info,
                        message: format!(
                            "user {} ({}) registered for trip {trip_id}",
                            identity.user_id, identity.display_name
                        ),
                    });
                }
                actions
            },
            Err(err) => self.membership_error_to_session(session_id, trip_id, 0, &err),
        }
    }

    /// Handle a connection being closed.
    ///
    /// Removes the connection from every room it had joined. Anything it
    /// had already handed to `handle_send` was persisted synchronously, so
    /// a disconnect mid-send never cancels the commit.
    fn handle_connection_closed(&mut self, session_id: u64, reason: &str) -> Vec<ServerAction> {
        let mut actions = Vec::new();

        if let Some(mut conn) = self.connections.remove(&session_id) {
            conn.close();
        }

        if let Some((_info, trips)) = self.registry.unregister_session(session_id) {
            actions.push(ServerAction::Log {
                level: LogLevel::Info,
                message: format!(
                    "connection {session_id} closed: {reason}, was in {} rooms",
                    trips.len()
                ),
            });
        }

        actions
    }

    /// Handle a periodic tick for timeout checking.
    fn handle_tick(&mut self) -> Vec<ServerAction> {
        let now = self.env.now();
        let mut actions = Vec::new();

        for (session_id, conn) in &mut self.connections {
            for action in conn.tick(now) {
                match action {
                    ConnectionAction::Close { reason } => {
                        actions.push(ServerAction::CloseConnection {
                            session_id: *session_id,
                            reason,
                        });
                    },
                }
            }
        }

        actions
    }

    /// Build a sender-only error frame followed by no state change.
    fn error_to_session(
        &self,
        session_id: u64,
        trip_id: u64,
        correlation_id: u128,
        payload: ErrorPayload,
    ) -> Vec<ServerAction> {
        let log = ServerAction::Log {
            level: LogLevel::Warn,
            message: format!(
                "rejecting operation for session {session_id} on trip {trip_id}: {}",
                payload.message
            ),
        };

        let mut header = FrameHeader::new(Opcode::Error);
        header.set_trip_id(trip_id);
        header.set_correlation_id(correlation_id);

        match Payload::Error(payload).into_frame(header) {
            Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }, log],
            Err(e) => vec![encode_failure_log(&e), log],
        }
    }

    /// Map a membership error onto the wire taxonomy.
    fn membership_error_to_session(
        &self,
        session_id: u64,
        trip_id: u64,
        correlation_id: u128,
        err: &MembershipError,
    ) -> Vec<ServerAction> {
        let payload = match err {
            MembershipError::TripNotFound(_) => ErrorPayload::not_found(trip_id),
            MembershipError::Storage(e) => ErrorPayload::storage(e.to_string()),
        };
        self.error_to_session(session_id, trip_id, correlation_id, payload)
    }

    /// Send an error frame and close the connection.
    fn refuse(&self, session_id: u64, payload: ErrorPayload, reason: &str) -> Vec<ServerAction> {
        let mut actions = self.error_to_session(session_id, 0, 0, payload);
        actions.push(ServerAction::CloseConnection {
            session_id,
            reason: reason.to_string(),
        });
        actions
    }

    /// All sessions subscribed to a trip room.
    pub fn sessions_in_trip(&self, trip_id: u64) -> impl Iterator<Item = u64> + '_ {
        self.registry.sessions_in_trip(trip_id)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }
}

fn encode_failure_log(err: &tripline_proto::ProtocolError) -> ServerAction {
    ServerAction::Log {
        level: LogLevel::Error,
        message: format!("failed to encode response frame: {err}"),
    }
}

impl<E, S> std::fmt::Debug for ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.connections.len())
            .field("session_count", &self.registry.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tripline_core::SessionKey;

    use super::*;
    use crate::storage::{MemoryStorage, TripRecord, UserRecord};

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            std::time::Instant::now()
        }

        fn sleep(&self, _duration: std::time::Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0xA5);
        }

        fn wall_clock_millis(&self) -> u64 {
            2_000_000
        }
    }

    fn session_key() -> SessionKey {
        SessionKey::from_seed([1u8; 32])
    }

    fn driver() -> ServerDriver<TestEnv, MemoryStorage> {
        let storage = MemoryStorage::new();
        storage.upsert_user(1, &UserRecord { display_name: "Alice Smith".to_string() }).unwrap();
        storage
            .create_trip(
                42,
                &TripRecord { owner_id: 1, name: "Lisbon".to_string(), created_at_secs: 0 },
            )
            .unwrap();

        let gateway = ConnectionGateway::new(session_key().verifier());
        ServerDriver::new(TestEnv, storage, gateway, ServerConfig::default())
    }

    fn hello_frame(user_id: u64) -> Frame {
        let token = session_key().issue(user_id, 1_000, 3_600);
        Payload::Hello(tripline_proto::payloads::session::Hello { token })
            .into_frame(FrameHeader::new(Opcode::Hello))
            .unwrap()
    }

    fn authenticate(driver: &mut ServerDriver<TestEnv, MemoryStorage>, session_id: u64, user_id: u64) {
        driver
            .process_event(ServerEvent::ConnectionAccepted { session_id })
            .unwrap();
        let actions = driver
            .process_event(ServerEvent::FrameReceived { session_id, frame: hello_frame(user_id) })
            .unwrap();
        assert!(
            actions.iter().any(|a| matches!(
                a,
                ServerAction::SendToSession { frame, .. }
                    if frame.header.opcode_enum() == Some(Opcode::HelloAck)
            )),
            "expected HelloAck, got {actions:?}"
        );
    }

    #[test]
    fn server_accepts_connection() {
        let mut server = driver();

        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        assert_eq!(server.connection_count(), 1);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Debug, .. }));
    }

    #[test]
    fn server_rejects_when_max_connections_exceeded() {
        let storage = MemoryStorage::new();
        let gateway = ConnectionGateway::new(session_key().verifier());
        let config = ServerConfig { max_connections: 2, ..Default::default() };
        let mut server = ServerDriver::new(TestEnv, storage, gateway, config);

        server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();
        server.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();

        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: 3 }).unwrap();

        assert_eq!(server.connection_count(), 2);
        assert!(matches!(actions[0], ServerAction::CloseConnection { .. }));
    }

    #[test]
    fn hello_authenticates_session() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);
    }

    #[test]
    fn frames_before_hello_are_refused() {
        let mut server = driver();
        server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        let mut header = FrameHeader::new(Opcode::JoinTrip);
        header.set_trip_id(42);
        let frame = Payload::JoinTrip.into_frame(header).unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame }).unwrap();

        assert!(actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { .. })));
        assert_eq!(server.sessions_in_trip(42).count(), 0);
    }

    #[test]
    fn bad_credential_refused_and_closed() {
        let mut server = driver();
        server.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        let other_key = SessionKey::from_seed([9u8; 32]);
        let token = other_key.issue(1, 1_000, 3_600);
        let frame = Payload::Hello(tripline_proto::payloads::session::Hello { token })
            .into_frame(FrameHeader::new(Opcode::Hello))
            .unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame }).unwrap();

        let error_sent = actions.iter().any(|a| matches!(
            a,
            ServerAction::SendToSession { frame, .. }
                if frame.header.opcode_enum() == Some(Opcode::Error)
        ));
        assert!(error_sent);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { .. })));
    }

    #[test]
    fn owner_joins_and_sends() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);

        let mut header = FrameHeader::new(Opcode::JoinTrip);
        header.set_trip_id(42);
        let join = Payload::JoinTrip.into_frame(header).unwrap();
        server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: join }).unwrap();

        assert_eq!(server.sessions_in_trip(42).collect::<Vec<_>>(), vec![1]);

        let mut header = FrameHeader::new(Opcode::SendMessage);
        header.set_trip_id(42);
        header.set_correlation_id(0xC0FFEE);
        let send = Payload::SendMessage(tripline_proto::payloads::chat::SendMessage {
            body: "  Hello  ".to_string(),
        })
        .into_frame(header)
        .unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: send }).unwrap();

        let broadcast = actions
            .iter()
            .find_map(|a| match a {
                ServerAction::BroadcastToTrip { trip_id, frame } => Some((*trip_id, frame.clone())),
                _ => None,
            })
            .expect("expected broadcast");

        assert_eq!(broadcast.0, 42);
        assert_eq!(broadcast.1.header.correlation_id(), 0xC0FFEE);
        assert_eq!(broadcast.1.header.message_id(), 1);

        match Payload::from_frame(&broadcast.1).unwrap() {
            Payload::NewMessage(new_message) => {
                // One surrounding-whitespace trim, nothing else
                assert_eq!(new_message.message.body, "Hello");
                assert_eq!(new_message.message.author_name, "Alice Smith");
            },
            other => panic!("expected NewMessage, got {other:?}"),
        }

        // Persisted before broadcast
        assert_eq!(server.storage().latest_message_id(42).unwrap(), Some(1));
    }

    #[test]
    fn empty_body_is_rejected_without_persistence() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);

        let mut header = FrameHeader::new(Opcode::SendMessage);
        header.set_trip_id(42);
        header.set_correlation_id(7);
        let send = Payload::SendMessage(tripline_proto::payloads::chat::SendMessage {
            body: "   \n\t ".to_string(),
        })
        .into_frame(header)
        .unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: send }).unwrap();

        let error = actions
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToSession { session_id: 1, frame } => Some(frame.clone()),
                _ => None,
            })
            .expect("expected error frame");

        assert_eq!(error.header.correlation_id(), 7);
        match Payload::from_frame(&error).unwrap() {
            Payload::Error(payload) => assert_eq!(payload.code, ErrorPayload::VALIDATION),
            other => panic!("expected Error, got {other:?}"),
        }

        assert!(!actions.iter().any(|a| matches!(a, ServerAction::BroadcastToTrip { .. })));
        assert_eq!(server.storage().latest_message_id(42).unwrap(), None);
    }

    #[test]
    fn oversized_body_is_rejected_without_persistence() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);

        let mut header = FrameHeader::new(Opcode::SendMessage);
        header.set_trip_id(42);
        header.set_correlation_id(9);
        let send = Payload::SendMessage(tripline_proto::payloads::chat::SendMessage {
            body: "x".repeat(MAX_BODY_LEN + 1),
        })
        .into_frame(header)
        .unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: send }).unwrap();

        let error = actions
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToSession { session_id: 1, frame } => {
                    Payload::from_frame(frame).ok()
                },
                _ => None,
            })
            .expect("expected error frame");
        match error {
            Payload::Error(payload) => assert_eq!(payload.code, ErrorPayload::VALIDATION),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(server.storage().latest_message_id(42).unwrap(), None);
    }

    #[test]
    fn unknown_trip_is_not_found() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);

        let mut header = FrameHeader::new(Opcode::JoinTrip);
        header.set_trip_id(999);
        let join = Payload::JoinTrip.into_frame(header).unwrap();

        let actions =
            server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: join }).unwrap();

        let error = actions
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToSession { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .expect("expected error frame");

        match Payload::from_frame(&error).unwrap() {
            Payload::Error(payload) => assert_eq!(payload.code, ErrorPayload::NOT_FOUND),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_cleans_up_rooms() {
        let mut server = driver();
        authenticate(&mut server, 1, 1);

        let mut header = FrameHeader::new(Opcode::JoinTrip);
        header.set_trip_id(42);
        let join = Payload::JoinTrip.into_frame(header).unwrap();
        server.process_event(ServerEvent::FrameReceived { session_id: 1, frame: join }).unwrap();

        server
            .process_event(ServerEvent::ConnectionClosed {
                session_id: 1,
                reason: "client disconnect".to_string(),
            })
            .unwrap();

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.sessions_in_trip(42).count(), 0);
    }

    #[test]
    fn register_participant_acks_idempotently() {
        let mut server = driver();
        server.storage().upsert_user(2, &UserRecord { display_name: "Bob Lee".to_string() }).unwrap();
        authenticate(&mut server, 5, 2);

        let register = |server: &mut ServerDriver<TestEnv, MemoryStorage>| {
            let mut header = FrameHeader::new(Opcode::RegisterParticipant);
            header.set_trip_id(42);
            let frame = Payload::RegisterParticipant.into_frame(header).unwrap();
            server.process_event(ServerEvent::FrameReceived { session_id: 5, frame }).unwrap()
        };

        let first = register(&mut server);
        let ack = first
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToSession { frame, .. } => Payload::from_frame(frame).ok(),
                _ => None,
            })
            .expect("expected ack");
        assert!(matches!(ack, Payload::RegisterAck(RegisterAck { created: true })));

        let second = register(&mut server);
        let ack = second
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToSession { frame, .. } => Payload::from_frame(frame).ok(),
                _ => None,
            })
            .expect("expected ack");
        assert!(matches!(ack, Payload::RegisterAck(RegisterAck { created: false })));
    }
}
