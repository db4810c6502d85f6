//! The embedded WebSocket state machine.
//!
//! The machine tracks connection and close-handshake state; it performs no
//! I/O itself. The adapter in `socket.rs` drives it from transport
//! notifications and dispatches the actions it returns to the factory.

use crate::error::{CloseStatus, SocketError, SocketResult};

/// Which side of the connection this socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound connection.
    Client,
    /// Listener-accepted connection.
    Server,
}

/// Events the replicator (or a test) observes on a socket.
///
/// All methods have empty defaults; implement the ones of interest.
pub trait SocketDelegate: Send + Sync {
    /// The HTTP handshake response arrived.
    fn on_got_http_response(&self, _status: u16, _headers: &burrow_codec::Value) {}
    /// The connection is established.
    fn on_connected(&self) {}
    /// A message (or raw bytes, when framed) arrived.
    fn on_received(&self, _data: &[u8]) {}
    /// The peer requested a close (unframed mode).
    fn on_close_requested(&self, _status: i32, _message: &str) {}
    /// The socket finished closing. Called exactly once.
    fn on_closed(&self, _status: &CloseStatus) {}
    /// A write completed on the transport.
    fn on_write_completed(&self, _byte_count: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Action the adapter must forward to the factory after a close
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Start (or acknowledge) the WebSocket close handshake.
    RequestClose(i32, String),
    /// Close the byte-oriented transport.
    CloseSocket,
}

/// Connection + close-handshake state for one socket.
#[derive(Debug)]
pub(crate) struct WebSocketState {
    framed: bool,
    state: State,
    http_status: Option<u16>,
    sent_close: bool,
    received_close: bool,
}

impl WebSocketState {
    pub(crate) fn new(framed: bool) -> Self {
        Self {
            framed,
            state: State::New,
            http_status: None,
            sent_close: false,
            received_close: false,
        }
    }

    pub(crate) fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Outbound connect was initiated.
    pub(crate) fn connect(&mut self) -> SocketResult<()> {
        if self.state != State::New {
            return Err(SocketError::invalid_state("socket already connected"));
        }
        self.state = State::Connecting;
        Ok(())
    }

    /// The HTTP handshake response arrived. A status of 300 or more is a
    /// peer error; the handshake cannot complete.
    pub(crate) fn got_http_response(&mut self, status: u16) -> SocketResult<()> {
        if self.state != State::Connecting && self.state != State::New {
            return Err(SocketError::invalid_state(
                "HTTP response after handshake finished",
            ));
        }
        self.http_status = Some(status);
        Ok(())
    }

    /// The transport reports the connection opened.
    pub(crate) fn on_connect(&mut self) -> SocketResult<()> {
        if let Some(status) = self.http_status {
            if status >= 300 {
                return Err(SocketError::invalid_state(format!(
                    "peer rejected the handshake with HTTP status {status}"
                )));
            }
        }
        match self.state {
            State::New | State::Connecting => {
                self.state = State::Connected;
                Ok(())
            }
            _ => Err(SocketError::invalid_state("socket is not connecting")),
        }
    }

    /// This side initiates a close.
    ///
    /// Returns the factory action, or `None` if a close is already in
    /// flight.
    pub(crate) fn start_close(
        &mut self,
        status: i32,
        message: &str,
    ) -> SocketResult<Option<CloseAction>> {
        match self.state {
            State::Closed => Ok(None),
            State::Closing if self.sent_close => Ok(None),
            _ => {
                self.state = State::Closing;
                self.sent_close = true;
                if self.framed {
                    Ok(Some(CloseAction::CloseSocket))
                } else {
                    Ok(Some(CloseAction::RequestClose(status, message.to_string())))
                }
            }
        }
    }

    /// The peer requested a close (unframed mode only).
    ///
    /// Returns the acknowledgement to send, or `None` when this side
    /// already sent its close (the handshake is reconciled and only the
    /// final `closed` notification remains).
    pub(crate) fn on_close_requested(
        &mut self,
        status: i32,
        message: &str,
    ) -> SocketResult<Option<CloseAction>> {
        if self.framed {
            return Err(SocketError::invalid_state(
                "closeRequested is only valid without framing",
            ));
        }
        if self.state == State::Closed {
            return Err(SocketError::invalid_state("socket already closed"));
        }
        self.received_close = true;
        if self.sent_close {
            return Ok(None);
        }
        self.state = State::Closing;
        self.sent_close = true;
        Ok(Some(CloseAction::RequestClose(status, message.to_string())))
    }

    /// The transport finished closing. Returns true the first time, so the
    /// delegate's `on_closed` fires exactly once.
    pub(crate) fn on_close(&mut self) -> bool {
        if self.state == State::Closed {
            return false;
        }
        self.state = State::Closed;
        true
    }

    pub(crate) fn check_connected(&self, what: &str) -> SocketResult<()> {
        match self.state {
            State::Connected | State::Closing => Ok(()),
            _ => Err(SocketError::invalid_state(format!(
                "{what} on a socket that is not connected"
            ))),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut ws = WebSocketState::new(false);
        ws.connect().unwrap();
        ws.got_http_response(200).unwrap();
        ws.on_connect().unwrap();
        ws.check_connected("write").unwrap();

        let action = ws.start_close(1000, "bye").unwrap();
        assert_eq!(action, Some(CloseAction::RequestClose(1000, "bye".into())));
        assert!(ws.on_close());
        assert!(!ws.on_close());
    }

    #[test]
    fn handshake_rejection_is_an_error_on_open() {
        let mut ws = WebSocketState::new(false);
        ws.connect().unwrap();
        ws.got_http_response(401).unwrap();
        assert!(ws.on_connect().is_err());
    }

    #[test]
    fn double_connect_is_invalid() {
        let mut ws = WebSocketState::new(true);
        ws.connect().unwrap();
        assert!(ws.connect().is_err());
    }

    #[test]
    fn framed_close_goes_to_close_socket() {
        let mut ws = WebSocketState::new(true);
        ws.connect().unwrap();
        ws.on_connect().unwrap();
        assert_eq!(
            ws.start_close(1000, "done").unwrap(),
            Some(CloseAction::CloseSocket)
        );
        // A second close attempt is a no-op.
        assert_eq!(ws.start_close(1000, "done").unwrap(), None);
    }

    #[test]
    fn peer_close_request_is_acknowledged_once() {
        let mut ws = WebSocketState::new(false);
        ws.connect().unwrap();
        ws.on_connect().unwrap();

        let ack = ws.on_close_requested(1000, "going away").unwrap();
        assert_eq!(
            ack,
            Some(CloseAction::RequestClose(1000, "going away".into()))
        );
    }

    #[test]
    fn crossing_closes_reconcile() {
        let mut ws = WebSocketState::new(false);
        ws.connect().unwrap();
        ws.on_connect().unwrap();

        // We close first; the peer's close request then needs no ack.
        ws.start_close(1000, "bye").unwrap();
        assert_eq!(ws.on_close_requested(1000, "bye").unwrap(), None);
        assert!(ws.on_close());
    }

    #[test]
    fn close_requested_invalid_when_framed() {
        let mut ws = WebSocketState::new(true);
        ws.connect().unwrap();
        ws.on_connect().unwrap();
        assert!(ws.on_close_requested(1000, "x").is_err());
    }

    #[test]
    fn writes_require_connection() {
        let ws = WebSocketState::new(true);
        assert!(ws.check_connected("write").is_err());
    }
}
