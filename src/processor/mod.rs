//! Protocol processor plugin contract.
//!
//! # Data Flow
//! ```text
//! accepted connection
//!     → Processor::init(client)                 (session Context)
//!     → Processor::init_sub(ctx, 0, client)     (frontend SubContext)
//!     → loop: Processor::process(ctx, sub)
//!          mode = handle → engine collects `want` bytes → Processor::feed
//!          mode = proxy  → engine relays `len` bytes   → Processor::proxy_done
//!     → Target::Select(hint) → Connector → new backend
//!          → Processor::init_sub(ctx, n, peer) → Processor::connected → Processor::chosen
//! ```
//!
//! # Design Decisions
//! - The relay engine never interprets payload; everything protocol-specific
//!   lives behind this trait
//! - Closures of the callback-style contract become trait methods (`feed`,
//!   `proxy_done`, `chosen`)
//! - Implementations: `h2` (binary multiplexed) and `passthrough` (raw TCP)

pub mod h2;
pub mod passthrough;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use crate::relay::PauseHandle;

/// Payloads at or below this size are copied instead of handed over by reference.
pub const DEFAULT_ZERO_COPY_THRESHOLD: usize = 1024;

/// Identifies one participant of a session: 0 is the frontend, 1..=1024 are backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u16);

impl ConnId {
    /// The client-facing connection.
    pub const FRONTEND: ConnId = ConnId(0);

    /// Highest backend id a session may hand out.
    pub const MAX_BACKEND: u16 = 1024;

    /// Build a backend id, `None` when out of range.
    pub fn backend(id: u16) -> Option<Self> {
        (1..=Self::MAX_BACKEND).contains(&id).then_some(Self(id))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_frontend(&self) -> bool {
        self.0 == 0
    }

    pub fn is_backend(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_frontend() {
            write!(f, "frontend")
        } else {
            write!(f, "backend-{}", self.0)
        }
    }
}

/// Routing hint handed to the connector when a new backend is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hint {
    pub host: Option<String>,
    pub uri: Option<String>,
}

impl Hint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of_host_uri(host: Option<String>, uri: Option<String>) -> Self {
        Self { host, uri }
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} uri={}",
            self.host.as_deref().unwrap_or("-"),
            self.uri.as_deref().unwrap_or("-")
        )
    }
}

/// How the engine treats the next bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Collect bytes and hand them to [`Processor::feed`].
    Handle,
    /// Relay bytes to the peer without looking at them.
    Proxy,
}

/// Amount of input the processor asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// Exactly this many bytes.
    Exactly(usize),
    /// Whatever is currently buffered.
    Available,
    /// Nothing: call `feed` (or `proxy_done`) right away.
    Nothing,
}

impl Want {
    pub fn len(&self) -> usize {
        match self {
            Want::Exactly(n) => *n,
            Want::Available | Want::Nothing => 0,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Want::Nothing | Want::Exactly(0))
    }
}

/// Where frontend output should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A backend already recorded in this session.
    Conn(ConnId),
    /// Let the connector pick (or coalesce) a backend.
    Select(Hint),
}

/// Instructions returned by [`Processor::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorTodo {
    pub mode: Mode,
    pub want: Want,
    /// Required for frontend proxying, ignored for backends (they always talk to the frontend).
    pub target: Option<Target>,
}

impl ProcessorTodo {
    pub fn handle(want: Want) -> Self {
        Self {
            mode: Mode::Handle,
            want,
            target: None,
        }
    }

    pub fn proxy(len: usize, target: Option<Target>) -> Self {
        let want = if len == 0 {
            Want::Nothing
        } else {
            Want::Exactly(len)
        };
        Self {
            mode: Mode::Proxy,
            want,
            target,
        }
    }
}

/// Result of feeding a complete unit to the processor.
#[derive(Debug, Clone, Default)]
pub struct HandleTodo {
    /// Bytes for the other side (backend for the frontend, frontend for a backend).
    pub send: Option<Bytes>,
    /// Ask for a backend even though nothing is sent yet.
    pub require_connection: bool,
    /// Destination of `send` when fed from the frontend.
    pub target: Option<Target>,
    /// Bytes written back to the connection that produced the input.
    pub produce: Option<Bytes>,
    /// The current frame is complete; another backend may now write to the frontend.
    pub frame_ends: bool,
}

impl HandleTodo {
    pub fn has_send(&self) -> bool {
        self.send.as_ref().is_some_and(|b| !b.is_empty())
    }
}

/// Result of a finished proxy segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyDone {
    pub frame_ends: bool,
}

/// How the engine should react to a backend going away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectTodo {
    /// `true`: only this backend closes. `false`: the whole session is torn down.
    pub silent: bool,
}

impl DisconnectTodo {
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

/// Errors a processor reports from `feed`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("protocol violation: {0}")]
    Violation(String),
}

impl ProcessError {
    pub fn violation(reason: impl Into<String>) -> Self {
        ProcessError::Violation(reason.into())
    }
}

/// A protocol plugin driven by the relay engine.
///
/// All methods run on the task that owns the session; the context and every
/// sub-context are never touched concurrently.
pub trait Processor: Send + Sync + 'static {
    type Context: Send;
    type SubContext: Send;

    fn name(&self) -> &'static str;

    /// Create the session-wide context for a newly accepted client.
    fn init(&self, client: SocketAddr) -> Self::Context;

    /// Create the per-connection state. `conn_id` 0 is the frontend.
    fn init_sub(
        &self,
        ctx: &mut Self::Context,
        conn_id: ConnId,
        peer: SocketAddr,
        delegate: PauseHandle,
    ) -> Self::SubContext;

    fn process(&self, ctx: &mut Self::Context, sub: &mut Self::SubContext) -> ProcessorTodo;

    /// Consume one complete unit requested by a `Mode::Handle` todo.
    fn feed(
        &self,
        ctx: &mut Self::Context,
        sub: &mut Self::SubContext,
        data: Bytes,
    ) -> Result<HandleTodo, ProcessError>;

    /// The bytes requested by a `Mode::Proxy` todo have been relayed.
    fn proxy_done(&self, ctx: &mut Self::Context, sub: &mut Self::SubContext) -> Option<ProxyDone>;

    /// A backend was picked (new or coalesced) for a `Target::Select` request.
    fn chosen(&self, ctx: &mut Self::Context, backend: &mut Self::SubContext);

    /// A backend was created; returned `produce` bytes are sent to it first.
    fn connected(&self, ctx: &mut Self::Context, sub: &mut Self::SubContext) -> Option<HandleTodo>;

    /// The backend sent FIN.
    fn remote_closed(
        &self,
        ctx: &mut Self::Context,
        sub: &mut Self::SubContext,
    ) -> Option<HandleTodo>;

    /// A backend is gone. `None` or a non-silent todo tears the session down.
    fn disconnected(
        &self,
        ctx: &mut Self::Context,
        sub: &mut Self::SubContext,
        error: bool,
    ) -> Option<DisconnectTodo>;

    /// Minimum proxy segment size for which zero-copy relaying is used.
    fn zero_copy_threshold(&self) -> usize {
        DEFAULT_ZERO_COPY_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_ranges() {
        assert!(ConnId::FRONTEND.is_frontend());
        assert!(ConnId::backend(0).is_none());
        assert!(ConnId::backend(1).is_some());
        assert!(ConnId::backend(1024).is_some());
        assert!(ConnId::backend(1025).is_none());
    }

    #[test]
    fn zero_length_proxy_wants_nothing() {
        let todo = ProcessorTodo::proxy(0, None);
        assert_eq!(todo.want, Want::Nothing);
        assert!(todo.want.is_nothing());
    }
}
