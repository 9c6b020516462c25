//! Session-level failures and their classification.

use std::io;

use thiserror::Error;

use crate::processor::{ConnId, Hint};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol violation on {conn}: {reason}")]
    ProtocolViolation { conn: ConnId, reason: String },

    #[error("no backend available ({hint})")]
    BackendUnavailable { hint: Hint },

    #[error("{0} is not part of this session")]
    UnknownBackend(ConnId),

    #[error("backend id space exhausted ({max} backends)")]
    ResourceExhaustion { max: u16 },

    #[error("i/o error on {conn}: {source}")]
    Io {
        conn: ConnId,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub fn violation(conn: ConnId, reason: impl Into<String>) -> Self {
        RelayError::ProtocolViolation {
            conn,
            reason: reason.into(),
        }
    }

    /// Whether this failure is routine network churn (logged at debug).
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            RelayError::ProtocolViolation { .. } | RelayError::UnknownBackend(_) => {
                CloseReason::ProtocolViolation
            }
            RelayError::BackendUnavailable { .. } => CloseReason::BackendUnavailable,
            RelayError::ResourceExhaustion { .. } => CloseReason::ResourceExhaustion,
            RelayError::Io { .. } => CloseReason::IoError,
        }
    }
}

/// Resets, aborts, broken pipes and truncated streams.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Why a session ended; used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed and every backend drained.
    HalfClosed,
    /// The frontend connection went away.
    FrontendClosed,
    /// A backend left and the processor could not continue without it.
    BackendClosed,
    ProtocolViolation,
    BackendUnavailable,
    ResourceExhaustion,
    IoError,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::HalfClosed => "half_closed",
            CloseReason::FrontendClosed => "frontend_closed",
            CloseReason::BackendClosed => "backend_closed",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::BackendUnavailable => "backend_unavailable",
            CloseReason::ResourceExhaustion => "resource_exhaustion",
            CloseReason::IoError => "io_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}
