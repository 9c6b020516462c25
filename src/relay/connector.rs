//! Backend resolution seam between the engine and routing.

use std::fmt;
use std::net::SocketAddr;

use crate::processor::Hint;

/// A concrete backend chosen for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub name: String,
    pub addr: SocketAddr,
}

impl BackendTarget {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.addr)
    }
}

/// Maps a client and a routing hint to a backend.
///
/// `None` means the hint is refused; the engine closes the session.
pub trait Connector: Send + Sync {
    fn resolve(&self, client: SocketAddr, hint: &Hint) -> Option<BackendTarget>;
}
