//! Relay engine: one frontend, many backends, one processor.
//!
//! # Responsibilities
//! - Drive a [`Processor`](crate::processor::Processor) over the bytes of every
//!   connection of a session
//! - Open, coalesce and retire backends on the processor's request
//! - Keep frames from different backends from interleaving on the frontend
//! - Half-close and teardown sequencing
//!
//! # Data Flow
//! ```text
//! socket readiness (net::session)
//!     → RelayEngine::on_readable / on_written / on_connected / ...
//!     → pump: read frontend → per backend (write, read, settle) → write frontend
//!     → Action queue (Connect / ShutdownWrite / Close) → net::session
//! ```
//!
//! # Design Decisions
//! - The engine performs no I/O itself; the session task owns the sockets
//! - Sessions are single-task, so no locks guard engine state

mod connector;
mod engine;
mod error;
mod flow;
mod pause;

pub use connector::{BackendTarget, Connector};
pub use engine::{Action, EngineConfig, RelayEngine};
pub use error::{is_transient_io, CloseReason, RelayError};
pub use flow::{ByteFlow, Step};
pub use pause::PauseHandle;
