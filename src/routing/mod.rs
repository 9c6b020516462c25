//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Routing hint (host, uri) from a processor
//!     → connector.rs (Connector implementation used by the engine)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → load_balancer (pick a backend of the route's group)
//!     → Return: BackendTarget or refusal
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Sort by priority
//!     → Compile matchers
//!     → Swap in as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Tables are immutable once built; reload swaps the whole table
//! - No regex in hot path (prefix matching only)
//! - First match wins (ordered by priority)

pub mod connector;
pub mod matcher;
pub mod router;

pub use connector::RouteConnector;
