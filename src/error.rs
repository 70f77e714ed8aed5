//! Error taxonomy for the communication core.
//!
//! Every failure surfaced by this crate is one of the variants below, so a
//! caller can decide between a persistent error banner, a dismissible
//! stale-data warning, or a redirect to re-authentication without inspecting
//! message strings.

use crate::ws;

/// Errors produced by the WebSocket communication core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    /// No bearer token is available locally; the network was never touched.
    NoLogin,
    /// The transport never reached the open state.
    Connect(String),
    /// The transport closed after having been open.
    Disconnect {
        /// WebSocket close code (1006 when the peer vanished without one).
        code: u16,
        /// Close reason supplied by the peer, possibly empty.
        reason: String,
    },
    /// The server closed the stream with code 4001: the token is no longer
    /// valid and the caller must redirect to re-authentication.
    AuthExpired,
    /// An inbound message on the multiplex channel did not parse as a frame.
    /// Fatal: the whole connection is torn down.
    Protocol(String),
    /// A pending session open was canceled by the caller. Never an error to
    /// surface; callers match on it and suppress it.
    Canceled,
}

impl WsError {
    /// Classify a close frame received on any stream type.
    ///
    /// Code 4001 universally means the token expired; 1000 still produces a
    /// `Disconnect` here because the multiplex channel treats any closure of
    /// an in-use transport as a failure (sessions classify 1000 separately
    /// via [`crate::session::CloseEvent::classify`]).
    pub fn from_close(code: u16, reason: &str) -> Self {
        if code == ws::CLOSE_AUTH_EXPIRED {
            WsError::AuthExpired
        } else {
            WsError::Disconnect {
                code,
                reason: reason.to_string(),
            }
        }
    }

    /// True for failures that happened before the transport ever opened.
    pub fn is_connect(&self) -> bool {
        matches!(self, WsError::NoLogin | WsError::Connect(_))
    }

    /// True for failures of a transport that had been open.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WsError::Disconnect { .. } | WsError::Protocol(_))
    }
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoLogin => write!(f, "not logged in"),
            Self::Connect(msg) => write!(f, "cannot connect websocket: {msg}"),
            Self::Disconnect { code, reason } => {
                write!(f, "websocket closed {code} {reason}")
            }
            Self::AuthExpired => write!(f, "authentication expired"),
            Self::Protocol(msg) => write!(f, "websocket invalid message: {msg}"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::error::Error for WsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_close_auth_expired() {
        assert_eq!(WsError::from_close(4001, "token expired"), WsError::AuthExpired);
    }

    #[test]
    fn test_from_close_other_codes_are_disconnects() {
        assert_eq!(
            WsError::from_close(1006, ""),
            WsError::Disconnect {
                code: 1006,
                reason: String::new()
            }
        );
        assert_eq!(
            WsError::from_close(1000, "bye"),
            WsError::Disconnect {
                code: 1000,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn test_connect_vs_disconnect_classification() {
        assert!(WsError::NoLogin.is_connect());
        assert!(WsError::Connect("refused".into()).is_connect());
        assert!(!WsError::Connect("refused".into()).is_disconnect());
        assert!(WsError::Disconnect {
            code: 1001,
            reason: String::new()
        }
        .is_disconnect());
        assert!(WsError::Protocol("bad json".into()).is_disconnect());
        assert!(!WsError::AuthExpired.is_disconnect());
        assert!(!WsError::AuthExpired.is_connect());
    }
}
