//! # Burrow Socket
//!
//! The socket adapter used by the replicator: a WebSocket state machine
//! bridged to a pluggable, client-supplied transport.
//!
//! The client installs a [`SocketFactory`], a table of callback slots the
//! adapter invokes to drive its transport, and declares a framing mode:
//!
//! - [`Framing::Framed`]: the transport is byte-oriented; the embedded
//!   state machine owns WebSocket framing and the close handshake, so the
//!   factory supplies `close` and no `request_close`.
//! - [`Framing::Unframed`]: the transport speaks WebSocket messages
//!   itself and implements the close handshake, so the factory supplies
//!   `request_close` and no `close`.
//!
//! Inbound notifications from the transport never propagate faults to the
//! caller: any inner failure closes the socket with WebSocket status 1011.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod factory;
mod socket;
mod ws;

pub use error::{
    CloseReason, CloseStatus, ErrorDomain, SocketError, SocketResult, TransportError,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};
pub use factory::{
    register_factory, register_internal_factory, Framing, InternalFactory, SocketFactory,
};
pub use socket::{create_web_socket, Socket, OPTION_HEARTBEAT, OPTION_WS_PROTOCOLS};
pub use ws::{Role, SocketDelegate};
