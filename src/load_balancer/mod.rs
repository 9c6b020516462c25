//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → backend_group identified
//!     → pool.rs (backends of the group)
//!     → round_robin.rs (rotate through backends)
//!     → Return backend target or None
//! ```
//!
//! # Design Decisions
//! - Selection is per new backend connection, not per stream: a session
//!   reuses a backend it already holds for the same address
//! - Algorithm selection per backend group

pub mod pool;
pub mod round_robin;

use crate::relay::BackendTarget;

/// Picks one backend out of a group.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(&self, backends: &[BackendTarget]) -> Option<BackendTarget>;
}
