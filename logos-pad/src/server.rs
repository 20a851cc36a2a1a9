//! WebSocket hub server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── Room "d1" ── [A, B]
//!             ├── ConnectionManager ──── SessionRegistry
//! Client B ──┘        │                 └── Room "d2" ── [C]
//!                     │
//!                     ├── ProtocolHandler ── BroadcastEngine ──► member queues
//!                     └── PresenceTracker ──┘
//! ```
//!
//! All document state lives in memory; nothing survives a restart.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::broadcast::{BroadcastEngine, BroadcastStats};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::protocol::{ProtocolError, UserId};
use crate::registry::SessionRegistry;

/// Default outbound queue bound per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default deadline for the WebSocket upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Deadline for completing the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("User {0} is already registered")]
    DuplicateUser(UserId),
    #[error("Connection task failed: {0}")]
    Task(String),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_handshakes: u64,
    /// Registered members right now
    pub members: usize,
    /// Documents created since start
    pub documents: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    failed_handshakes: AtomicU64,
}

/// The hub server.
#[derive(Clone)]
pub struct HubServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    engine: BroadcastEngine,
    connections: ConnectionManager,
    counters: Arc<ConnectionCounters>,
}

impl HubServer {
    /// Create a new hub server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let connections = ConnectionManager::new(
            engine.clone(),
            ConnectionConfig {
                queue_capacity: config.queue_capacity,
                handshake_timeout: config.handshake_timeout,
            },
        );
        Self {
            config,
            registry,
            engine,
            connections,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Hub listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, addr).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);

        match self.connections.serve(stream, addr).await {
            Ok(()) => log::info!("Connection closed from {addr}"),
            Err(HubError::Handshake(e)) => {
                self.counters.failed_handshakes.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected connection from {addr}: handshake failed: {e}");
            }
            Err(HubError::Transport(e)) => log::info!("Connection from {addr} dropped: {e}"),
            Err(e) => log::error!("Connection error from {addr}: {e}"),
        }

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            failed_handshakes: self.counters.failed_handshakes.load(Ordering::Relaxed),
            members: self.registry.member_count().await,
            documents: self.registry.document_count().await,
            broadcast: self.engine.stats(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
