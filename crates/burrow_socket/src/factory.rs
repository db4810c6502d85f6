//! The pluggable socket factory.

use crate::error::{SocketError, SocketResult};
use crate::socket::Socket;
use burrow_codec::Value;
use std::sync::{Arc, OnceLock};

/// Who owns WebSocket framing and the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The adapter's state machine frames messages; the transport moves
    /// raw bytes and closes via `close`.
    Framed,
    /// The transport is message-oriented and implements the close
    /// handshake itself via `request_close`.
    Unframed,
}

/// Callback invoked to open the transport.
pub type OpenFn = Box<dyn Fn(&Socket) + Send + Sync>;
/// Callback invoked to write bytes (or one message, when unframed).
pub type WriteFn = Box<dyn Fn(&Socket, &[u8]) + Send + Sync>;
/// Callback acknowledging that received bytes have been processed.
pub type CompletedReceiveFn = Box<dyn Fn(&Socket, usize) + Send + Sync>;
/// Callback closing a byte-oriented transport (framed mode only).
pub type CloseFn = Box<dyn Fn(&Socket) + Send + Sync>;
/// Callback starting the WebSocket close handshake (unframed mode only).
pub type RequestCloseFn = Box<dyn Fn(&Socket, i32, &str) + Send + Sync>;
/// Callback releasing transport resources when the socket is dropped.
pub type DisposeFn = Box<dyn Fn(&Socket) + Send + Sync>;

/// The table of transport callbacks installed by the client.
///
/// `write` and `completed_receive` are always required. The close slots
/// depend on the framing mode: unframed transports must supply
/// `request_close` and no `close`; framed transports the opposite.
pub struct SocketFactory {
    /// Framing mode of sockets built from this factory.
    pub framing: Framing,
    /// Opens the transport (client role).
    pub open: Option<OpenFn>,
    /// Writes outgoing data.
    pub write: Option<WriteFn>,
    /// Acknowledges processed incoming data (flow control).
    pub completed_receive: Option<CompletedReceiveFn>,
    /// Closes the transport (framed only).
    pub close: Option<CloseFn>,
    /// Requests a WebSocket close handshake (unframed only).
    pub request_close: Option<RequestCloseFn>,
    /// Releases per-socket transport resources.
    pub dispose: Option<DisposeFn>,
}

impl SocketFactory {
    /// Creates an empty factory table for the given framing mode.
    ///
    /// The required slots must be filled in before the factory passes
    /// [`validate`](Self::validate).
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            open: None,
            write: None,
            completed_receive: None,
            close: None,
            request_close: None,
            dispose: None,
        }
    }

    /// Checks the framing rules.
    pub fn validate(&self) -> SocketResult<()> {
        if self.write.is_none() {
            return Err(SocketError::invalid_factory("write must be provided"));
        }
        if self.completed_receive.is_none() {
            return Err(SocketError::invalid_factory(
                "completedReceive must be provided",
            ));
        }
        match self.framing {
            Framing::Unframed => {
                if self.close.is_some() {
                    return Err(SocketError::invalid_factory(
                        "an unframed factory must not provide close",
                    ));
                }
                if self.request_close.is_none() {
                    return Err(SocketError::invalid_factory(
                        "an unframed factory must provide requestClose",
                    ));
                }
            }
            Framing::Framed => {
                if self.close.is_none() {
                    return Err(SocketError::invalid_factory(
                        "a framed factory must provide close",
                    ));
                }
                if self.request_close.is_some() {
                    return Err(SocketError::invalid_factory(
                        "a framed factory must not provide requestClose",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SocketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFactory")
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

/// Fallback constructor used when no client factory is installed: builds a
/// socket over an in-process transport.
pub type InternalFactory =
    Box<dyn Fn(&str, &Value) -> SocketResult<Arc<Socket>> + Send + Sync>;

fn registered() -> &'static OnceLock<Arc<SocketFactory>> {
    static REGISTERED: OnceLock<Arc<SocketFactory>> = OnceLock::new();
    &REGISTERED
}

fn internal() -> &'static OnceLock<InternalFactory> {
    static INTERNAL: OnceLock<InternalFactory> = OnceLock::new();
    &INTERNAL
}

/// One-time process-wide registration of the default socket factory.
///
/// A second registration fails without touching the registered factory.
pub fn register_factory(factory: SocketFactory) -> SocketResult<()> {
    factory.validate()?;
    registered()
        .set(Arc::new(factory))
        .map_err(|_| SocketError::FactoryAlreadyRegistered)
}

/// Registers the in-process fallback factory.
pub fn register_internal_factory(factory: InternalFactory) {
    let _ = internal().set(factory);
}

pub(crate) fn registered_factory() -> Option<Arc<SocketFactory>> {
    registered().get().cloned()
}

pub(crate) fn internal_factory() -> Option<&'static InternalFactory> {
    internal().get()
}
