//! Socket error taxonomy and close-status mapping.

use thiserror::Error;

/// WebSocket status for a normal close.
pub const CLOSE_NORMAL: i32 = 1000;
/// WebSocket status for an unexpected internal condition.
pub const CLOSE_INTERNAL_ERROR: i32 = 1011;

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;

/// Errors surfaced by the socket adapter's own API.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The factory table violates the framing rules.
    #[error("invalid socket factory: {message}")]
    InvalidFactory {
        /// Description of the violated rule.
        message: String,
    },

    /// A factory is already registered for this process.
    #[error("a socket factory is already registered")]
    FactoryAlreadyRegistered,

    /// No factory was supplied and none is registered.
    #[error("no default socket factory registered")]
    NoFactory,

    /// The state machine received a notification it cannot accept.
    #[error("invalid socket state: {message}")]
    InvalidState {
        /// Description of the state violation.
        message: String,
    },
}

impl SocketError {
    pub(crate) fn invalid_factory(message: impl Into<String>) -> Self {
        Self::InvalidFactory {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

/// Domain of an error reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// A WebSocket-level close status.
    WebSocket,
    /// An operating-system error.
    Posix,
    /// A network-stack error.
    Network,
    /// Anything else.
    Other,
}

/// An error handed to [`crate::Socket::closed`] by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Error domain.
    pub domain: ErrorDomain,
    /// Domain-specific code; 0 means "no error".
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl TransportError {
    /// A "no error" value: the transport closed normally.
    #[must_use]
    pub fn none() -> Self {
        Self {
            domain: ErrorDomain::WebSocket,
            code: 0,
            message: String::new(),
        }
    }

    /// A POSIX error.
    #[must_use]
    pub fn posix(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Posix,
            code,
            message: message.into(),
        }
    }

    /// A network error.
    #[must_use]
    pub fn network(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Network,
            code,
            message: message.into(),
        }
    }

    /// A WebSocket close status from the peer.
    #[must_use]
    pub fn web_socket(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::WebSocket,
            code,
            message: message.into(),
        }
    }
}

/// Classification of why a socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed via the WebSocket protocol.
    WebSocketClose,
    /// An operating-system error.
    PosixError,
    /// A network error.
    NetworkError,
    /// Unclassified.
    UnknownError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CloseReason::WebSocketClose => "WebSocket close",
            CloseReason::PosixError => "POSIX error",
            CloseReason::NetworkError => "network error",
            CloseReason::UnknownError => "unknown",
        })
    }
}

/// Final close disposition delivered to the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Why the socket closed.
    pub reason: CloseReason,
    /// Domain-specific code (WebSocket status, errno, ...).
    pub code: i32,
    /// Human-readable message, derived from the underlying error.
    pub message: String,
}

impl CloseStatus {
    /// Maps a transport error into a close status.
    ///
    /// Code 0 is a normal WebSocket close (1000); otherwise the reason
    /// follows the error's domain and the raw code is preserved.
    #[must_use]
    pub fn from_transport_error(error: &TransportError) -> Self {
        if error.code == 0 {
            return Self {
                reason: CloseReason::WebSocketClose,
                code: CLOSE_NORMAL,
                message: error.message.clone(),
            };
        }
        let reason = match error.domain {
            ErrorDomain::WebSocket => CloseReason::WebSocketClose,
            ErrorDomain::Posix => CloseReason::PosixError,
            ErrorDomain::Network => CloseReason::NetworkError,
            ErrorDomain::Other => CloseReason::UnknownError,
        };
        Self {
            reason,
            code: error.code,
            message: error.message.clone(),
        }
    }
}
