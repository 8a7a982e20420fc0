//! Error types for session handling.
//!
//! Every variant is fatal to the connection it was raised on. The only
//! retry primitive in the runtime is the transport's would-block signal,
//! which is a normal suspension and never surfaces as an error.

use std::io;
use thiserror::Error;

/// Why a connection was torn down.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The local socket address could not be determined.
    #[error("failed to resolve local address: {0}")]
    AddressResolution(#[source] io::Error),

    /// Memory for the session or its receive buffer could not be obtained.
    #[error("failed to allocate {what}")]
    Allocation { what: &'static str },

    /// A connection limiting or access control phase refused the session.
    #[error("access denied by {phase}")]
    AccessDenied { phase: &'static str },

    /// TLS negotiation failed, timed out, or finished without a handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Re-arming readiness notification with the event loop failed.
    #[error("failed to register readiness: {0}")]
    ReadinessRegistration(#[source] io::Error),

    /// Hard I/O error, socket option failure, or the peer closed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

impl SessionError {
    /// Orderly close by the peer (zero-byte read).
    pub fn peer_closed() -> Self {
        SessionError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed connection",
        ))
    }

    /// Short name of the error class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::AddressResolution(_) => "address_resolution",
            SessionError::Allocation { .. } => "allocation",
            SessionError::AccessDenied { .. } => "access_denied",
            SessionError::Handshake(_) => "handshake",
            SessionError::ReadinessRegistration(_) => "readiness_registration",
            SessionError::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_closed_is_transport_error() {
        let err = SessionError::peer_closed();
        assert_eq!(err.kind(), "transport");
        assert_eq!(err.to_string(), "transport error: client closed connection");
    }

    #[test]
    fn test_error_messages() {
        let err = SessionError::AccessDenied { phase: "access" };
        assert_eq!(err.to_string(), "access denied by access");

        let err = SessionError::Handshake("timed out".to_string());
        assert_eq!(err.to_string(), "handshake failed: timed out");
    }
}
