//! Tripline production server.
//!
//! Production runtime wrapping the action-based [`ServerDriver`] with Quinn
//! QUIC transport, a Tokio runtime, and system time/RNG.
//!
//! # Architecture
//!
//! The driver is pure logic (events in, actions out) and lives behind a
//! single Tokio mutex. That mutex IS the single event-processing context:
//! room membership, the message-id cache, and the connection table are only
//! ever touched while it is held, so they need no further synchronization.
//! Authorization lookups and persistence are synchronous calls made inside
//! the driver, which is what guarantees a message is durably committed
//! before its broadcast action even exists.
//!
//! # Components
//!
//! - [`ServerDriver`]: action-based orchestrator (no I/O)
//! - [`Server`]: production runtime executing driver actions
//! - [`QuinnTransport`]: QUIC transport via the quinn library
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod gateway;
pub mod membership;
mod message_log;
mod registry;
mod server_error;
pub mod storage;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc};

use bytes::BytesMut;
pub use driver::{LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use gateway::{AuthError, ConnectionGateway};
pub use membership::MembershipError;
pub use message_log::{MessageLog, MessageLogError};
pub use registry::{ConnectionRegistry, SessionInfo};
pub use server_error::ServerError as DriverError;
pub use storage::{
    MemoryStorage, ParticipantRecord, RedbStorage, Storage, StorageError, TripRecord, UserRecord,
};
pub use system_env::SystemEnv;
use tokio::sync::RwLock;
use tripline_core::{SessionVerifier, env::Environment};
use tripline_proto::{Frame, FrameHeader};
pub use transport::{QuinnConnection, QuinnTransport};
use zerocopy::FromBytes;

/// Shared per-connection I/O state.
struct SharedState {
    /// Session ID → QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Session ID → persistent outbound stream. All frames to a client go
    /// through this single stream, which preserves commit order end to end.
    outbound_streams: RwLock<HashMap<u64, tokio::sync::Mutex<quinn::SendStream>>>,
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            driver: DriverConfig::default(),
        }
    }
}

/// Production tripline server.
///
/// Wraps `ServerDriver` with Quinn QUIC transport and the system
/// environment. Generic over the storage backend so deployments choose
/// between [`MemoryStorage`] and [`RedbStorage`].
pub struct Server<S: Storage> {
    /// The action-based server driver
    driver: ServerDriver<SystemEnv, S>,
    /// QUIC endpoint
    transport: QuinnTransport,
    /// Environment
    env: SystemEnv,
}

impl<S: Storage> Server<S> {
    /// Create and bind a new server.
    pub fn bind(
        config: ServerRuntimeConfig,
        storage: S,
        verifier: SessionVerifier,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let gateway = ConnectionGateway::new(verifier);
        let driver = ServerDriver::new(env.clone(), storage, gateway, config.driver);

        let transport =
            QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;

        Ok(Self { driver, transport, env })
    }

    /// Run the server, accepting connections and processing frames.
    ///
    /// Runs until the endpoint closes or an unrecoverable error occurs.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let env = self.env;
        let driver = Arc::new(tokio::sync::Mutex::new(self.driver));
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound_streams: RwLock::new(HashMap::new()),
        });

        // Periodic tick for handshake/idle timeout sweeps
        {
            let driver = Arc::clone(&driver);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    let mut driver = driver.lock().await;
                    match driver.process_event(ServerEvent::Tick) {
                        Ok(actions) => {
                            if let Err(e) = execute_actions(&mut driver, actions, &shared).await {
                                tracing::warn!("tick action execution failed: {}", e);
                            }
                        },
                        Err(e) => tracing::warn!("tick processing failed: {}", e),
                    }
                }
            });
        }

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, driver, shared, env).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Handle a single QUIC connection.
async fn handle_connection<S: Storage>(
    conn: QuinnConnection,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let session_id = env.random_u64();

    tracing::debug!("New connection: {}", session_id);

    let outbound_stream = conn
        .open_uni()
        .await
        .map_err(|e| ServerError::Internal(format!("failed to open outbound stream: {e}")))?;

    {
        let mut connections = shared.connections.write().await;
        connections.insert(session_id, conn.clone());
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.insert(session_id, tokio::sync::Mutex::new(outbound_stream));
    }

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(ServerEvent::ConnectionAccepted { session_id })?;
        execute_actions(&mut driver, actions, &shared).await?;
    }

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);

                tokio::spawn(async move {
                    if let Err(e) = handle_stream(session_id, send, recv, driver, &shared).await {
                        tracing::debug!("Stream error: {}", e);
                    }
                });
            },
            Err(e) => {
                tracing::debug!("Connection closed: {}", e);
                break;
            },
        }
    }

    {
        let mut connections = shared.connections.write().await;
        connections.remove(&session_id);
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.remove(&session_id);
    }

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(ServerEvent::ConnectionClosed {
            session_id,
            reason: "connection closed".to_string(),
        })?;
        execute_actions(&mut driver, actions, &shared).await?;
    }

    Ok(())
}

/// Handle a single bidirectional stream of client frames.
async fn handle_stream<S: Storage>(
    session_id: u64,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S>>>,
    shared: &Arc<SharedState>,
) -> Result<(), ServerError> {
    drop(send); // replies go over the per-session outbound stream

    let mut buf = BytesMut::with_capacity(65536);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);

        match recv.read_exact(&mut buf[..FrameHeader::SIZE]).await {
            Ok(()) => {},
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break;
            },
        }

        let header: &FrameHeader = match FrameHeader::ref_from_bytes(&buf[..FrameHeader::SIZE]) {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!("Invalid frame header");
                break;
            },
        };

        let payload_size = header.payload_size() as usize;

        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            if let Err(e) = recv.read_exact(&mut buf[FrameHeader::SIZE..]).await {
                tracing::debug!("Payload read error: {}", e);
                break;
            }
        }

        let frame = match Frame::decode(&buf) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Frame decode error: {}", e);
                break;
            },
        };

        let mut driver = driver.lock().await;
        let actions = match driver.process_event(ServerEvent::FrameReceived { session_id, frame })
        {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!("Frame processing error: {}", e);
                continue;
            },
        };

        execute_actions(&mut driver, actions, shared).await?;
    }

    Ok(())
}

/// Execute server actions in order.
///
/// Broadcast reads the room membership from the driver at execution time,
/// after the awaited authorization and persistence completed. A member who
/// left mid-send may therefore still receive the message, and one who
/// joined mid-send will not; an accepted race, documented rather than
/// locked away.
async fn execute_actions<S: Storage>(
    driver: &mut ServerDriver<SystemEnv, S>,
    actions: Vec<ServerAction>,
    shared: &SharedState,
) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, frame } => {
                let mut buf = Vec::new();
                frame.encode(&mut buf).map_err(|e| ServerError::Protocol(e.to_string()))?;

                let streams = shared.outbound_streams.read().await;
                if let Some(stream_mutex) = streams.get(&session_id) {
                    let mut stream = stream_mutex.lock().await;
                    if let Err(e) = stream.write_all(&buf).await {
                        tracing::warn!("SendToSession write failed for {}: {}", session_id, e);
                    }
                } else {
                    tracing::warn!("SendToSession: session {} not found", session_id);
                }
            },

            ServerAction::BroadcastToTrip { trip_id, frame } => {
                let sessions: Vec<u64> = driver.sessions_in_trip(trip_id).collect();

                let mut buf = Vec::new();
                frame.encode(&mut buf).map_err(|e| ServerError::Protocol(e.to_string()))?;

                let streams = shared.outbound_streams.read().await;
                for session_id in sessions {
                    if let Some(stream_mutex) = streams.get(&session_id) {
                        let mut stream = stream_mutex.lock().await;
                        if let Err(e) = stream.write_all(&buf).await {
                            tracing::warn!("Broadcast write failed for {}: {}", session_id, e);
                        }
                    }
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!("Closing connection {}: {}", session_id, reason);
                let mut connections = shared.connections.write().await;
                if let Some(conn) = connections.remove(&session_id) {
                    conn.close(0u32.into(), reason.as_bytes());
                }
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }

    Ok(())
}
