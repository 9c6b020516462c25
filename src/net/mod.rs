//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (connection id, session tracking)
//!     → server.rs (processor selection, one task per session)
//!     → session.rs (socket I/O driving a relay engine)
//!     → buffer.rs (output buffers, copied or adopted chunks)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each session tracked for graceful shutdown
//! - All sockets of a session are owned by a single task

pub mod buffer;
pub mod connection;
pub mod listener;
pub mod server;
pub mod session;

pub use buffer::OutBuffer;
pub use connection::ConnectionTracker;
pub use listener::{Listener, ListenerError};
pub use server::Server;
