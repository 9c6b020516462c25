//! Connection-multiplexing reverse proxy.
//!
//! A client session is one frontend connection plus any number of backend
//! connections. A protocol [`processor`] decides what every byte means; the
//! [`relay`] engine moves the bytes; [`net`] owns the sockets.

pub mod config;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod processor;
pub mod relay;
pub mod routing;

pub use config::RelayConfig;
pub use lifecycle::Shutdown;
pub use net::Server;
pub use relay::RelayEngine;
