//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Relay engine, processors, network driver:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (fmt or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`conn`, `stream`, `backend`) instead of formatted text
//! - Per-frame detail only at trace level

pub mod logging;
pub mod metrics;
