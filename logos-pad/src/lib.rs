//! # logos-pad: Real-time collaborative plain-text editing hub
//!
//! Clients connect over WebSocket to a named document, receive its current
//! state, and exchange JSON messages with everyone else editing the same
//! document. The last full-text write wins; there is no merging.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws://host/?doc=d1&user=Alice  ┌───────────────────┐
//! │ Client A │ ◄────────────────────────────► │ ConnectionManager │
//! └──────────┘       JSON text frames         │ (one per socket)  │
//!                                             └─────────┬─────────┘
//!                                                       │
//!                              ┌────────────────────────┼───────────────┐
//!                              ▼                        ▼               │
//!                      ┌─────────────────┐    ┌─────────────────┐       │
//!                      │ ProtocolHandler │    │ PresenceTracker │       │
//!                      └────────┬────────┘    └────────┬────────┘       │
//!                               └───────────┬──────────┘                │
//!                                           ▼                           ▼
//!                                  ┌─────────────────┐       ┌─────────────────┐
//!                                  │ BroadcastEngine │ ────► │ SessionRegistry │
//!                                  │ (fan-out)       │       │ members, rooms, │
//!                                  └─────────────────┘       │ documents       │
//!                                                            └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and message kinds
//! - [`registry`]: Members, rooms and documents behind one lock
//! - [`broadcast`]: Room fan-out with evict-on-overflow backpressure
//! - [`presence`]: Join/leave/rename announcements and member lists
//! - [`handler`]: Dispatch of inbound client messages
//! - [`connection`]: Per-socket lifecycle (handshake, read/write loops, cleanup)
//! - [`server`]: Accept loop, configuration and statistics
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Envelope encode | <2µs |
//! | Fan-out of one payload × 100 members | <100µs |
//! | Outbound queue per member | 1024 messages |

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod presence;
pub mod handler;
pub mod connection;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, Envelope, Inbound, MessageKind, Payload, ProtocolError, UserId, UserMeta,
};
pub use registry::{Departure, DocumentSnapshot, FanOut, Member, SessionRegistry};
pub use broadcast::{BroadcastEngine, BroadcastStats};
pub use presence::PresenceTracker;
pub use handler::{ProtocolHandler, Session};
pub use connection::{ConnectionConfig, ConnectionManager, HandshakeParams};
pub use server::{HubError, HubServer, ServerConfig, ServerStats};
