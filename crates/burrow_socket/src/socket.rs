//! The socket adapter.
//!
//! A [`Socket`] binds the embedded WebSocket state machine to one
//! transport built from a [`SocketFactory`]. Inbound notifications arrive
//! from the transport (`opened`, `received`, `closed`, ...); outbound
//! operations are forwarded to the factory's callback slots. Any failure
//! inside an inbound notification closes the socket with status 1011
//! instead of surfacing to the transport.

use crate::error::{
    CloseStatus, SocketError, SocketResult, TransportError, CLOSE_INTERNAL_ERROR,
};
use crate::factory::{internal_factory, registered_factory, Framing, SocketFactory};
use crate::ws::{CloseAction, Role, SocketDelegate, WebSocketState};
use burrow_codec::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Option key naming the WebSocket subprotocols to offer.
pub const OPTION_WS_PROTOCOLS: &str = "WS-Protocols";
/// Option key giving the heartbeat interval in seconds.
pub const OPTION_HEARTBEAT: &str = "heartbeat";

/// A replication socket bridged to a pluggable transport.
pub struct Socket {
    role: Role,
    url: String,
    options: Value,
    factory: Arc<SocketFactory>,
    state: Mutex<WebSocketState>,
    delegate: Mutex<Option<Weak<dyn SocketDelegate>>>,
    native_handle: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Creates an outbound (client-role) socket.
///
/// The factory is resolved in order: the explicit `factory` argument, the
/// process-registered factory, then the internal in-process factory.
pub fn create_web_socket(
    url: &str,
    options: Value,
    factory: Option<SocketFactory>,
    native_handle: Option<Box<dyn Any + Send>>,
) -> SocketResult<Arc<Socket>> {
    if let Some(factory) = factory {
        return Socket::build(Role::Client, url, options, Arc::new(factory), native_handle);
    }
    if let Some(factory) = registered_factory() {
        return Socket::build(Role::Client, url, options, factory, native_handle);
    }
    if let Some(internal) = internal_factory() {
        return internal(url, &options);
    }
    Err(SocketError::NoFactory)
}

impl Socket {
    fn build(
        role: Role,
        url: &str,
        options: Value,
        factory: Arc<SocketFactory>,
        native_handle: Option<Box<dyn Any + Send>>,
    ) -> SocketResult<Arc<Self>> {
        factory.validate()?;
        let framed = factory.framing == Framing::Framed;
        Ok(Arc::new(Self {
            role,
            url: url.to_string(),
            options,
            factory,
            state: Mutex::new(WebSocketState::new(framed)),
            delegate: Mutex::new(None),
            native_handle: Mutex::new(native_handle),
        }))
    }

    /// Creates a server-role socket for a listener-accepted connection.
    ///
    /// `native_handle` is the factory's representation of the already-
    /// established transport.
    pub fn from_native(
        factory: SocketFactory,
        native_handle: Box<dyn Any + Send>,
        url: &str,
    ) -> SocketResult<Arc<Self>> {
        Self::build(
            Role::Server,
            url,
            Value::Map(Vec::new()),
            Arc::new(factory),
            Some(native_handle),
        )
    }

    /// The socket's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The options dictionary this socket was created with.
    #[must_use]
    pub fn options(&self) -> &Value {
        &self.options
    }

    /// The factory's framing mode.
    #[must_use]
    pub fn framing(&self) -> Framing {
        self.factory.framing
    }

    /// WebSocket subprotocols from the options, if any.
    #[must_use]
    pub fn ws_protocols(&self) -> Option<&str> {
        self.options.get(OPTION_WS_PROTOCOLS).and_then(Value::as_text)
    }

    /// Heartbeat interval in seconds from the options, if any.
    #[must_use]
    pub fn heartbeat_secs(&self) -> Option<u64> {
        self.options.get(OPTION_HEARTBEAT).and_then(Value::as_u64)
    }

    /// Installs the delegate that observes this socket.
    pub fn set_delegate(&self, delegate: Weak<dyn SocketDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// Associates an opaque transport value with this socket.
    pub fn set_native_handle(&self, handle: Option<Box<dyn Any + Send>>) {
        *self.native_handle.lock() = handle;
    }

    /// Runs `f` with the opaque transport value.
    pub fn with_native_handle<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let guard = self.native_handle.lock();
        f(guard.as_deref())
    }

    // -----------------------------------------------------------------
    // Outbound: adapter -> factory

    /// Starts connecting: advances the state machine and asks the factory
    /// to open its transport.
    pub fn connect(&self) -> SocketResult<()> {
        self.state.lock().connect()?;
        debug!(url = %self.url, "socket connecting");
        if let Some(open) = &self.factory.open {
            open(self);
        }
        Ok(())
    }

    /// Sends bytes (one message, when unframed) through the factory.
    pub fn send_bytes(&self, bytes: &[u8]) -> SocketResult<()> {
        self.state.lock().check_connected("write")?;
        if let Some(write) = &self.factory.write {
            write(self, bytes);
        }
        Ok(())
    }

    /// Acknowledges processed received bytes for flow control.
    pub fn receive_complete(&self, byte_count: usize) {
        if let Some(completed) = &self.factory.completed_receive {
            completed(self, byte_count);
        }
    }

    /// Initiates (or acknowledges) a close with the given status.
    ///
    /// With framing the state machine owns the handshake and the transport
    /// is simply closed; without framing the factory's `request_close`
    /// starts the WebSocket close handshake.
    pub fn close(&self, status: i32, message: &str) -> SocketResult<()> {
        let action = self.state.lock().start_close(status, message)?;
        self.dispatch_close_action(action);
        Ok(())
    }

    /// Forwards a close-handshake request to the factory (unframed mode).
    pub fn request_close(&self, status: i32, message: &str) {
        if let Some(request_close) = &self.factory.request_close {
            request_close(self, status, message);
        }
    }

    /// Forwards a transport close to the factory (framed mode).
    pub fn close_socket(&self) {
        if let Some(close) = &self.factory.close {
            close(self);
        }
    }

    fn dispatch_close_action(&self, action: Option<CloseAction>) {
        match action {
            Some(CloseAction::RequestClose(status, message)) => {
                self.request_close(status, &message);
            }
            Some(CloseAction::CloseSocket) => self.close_socket(),
            None => {}
        }
    }

    // -----------------------------------------------------------------
    // Inbound: transport -> adapter
    //
    // Every inbound notification converts inner faults into a 1011 close;
    // nothing propagates back to the transport.

    /// The transport received the HTTP handshake response.
    ///
    /// A status of 300 or more (or a WebSocket close status of 1000 or
    /// more delivered via [`closed`](Self::closed)) is a peer error during
    /// the handshake.
    pub fn got_http_response(&self, status: u16, headers: &Value) {
        let result = (|| -> SocketResult<()> {
            self.state.lock().got_http_response(status)?;
            self.with_delegate(|d| d.on_got_http_response(status, headers));
            Ok(())
        })();
        self.guard(result);
    }

    /// The transport's open request completed successfully.
    pub fn opened(&self) {
        let result = (|| -> SocketResult<()> {
            self.state.lock().on_connect()?;
            debug!(url = %self.url, "socket opened");
            self.with_delegate(|d| d.on_connected());
            Ok(())
        })();
        self.guard(result);
    }

    /// The peer requested a WebSocket close (unframed transports only).
    pub fn close_requested(&self, status: i32, message: &str) {
        let result = (|| -> SocketResult<()> {
            let action = self.state.lock().on_close_requested(status, message)?;
            self.with_delegate(|d| d.on_close_requested(status, message));
            self.dispatch_close_action(action);
            Ok(())
        })();
        self.guard(result);
    }

    /// The transport finished closing, disconnected, or failed to open.
    ///
    /// The error is mapped to a close status: code 0 is a normal close
    /// (1000); otherwise the reason follows the error's domain with the
    /// raw code preserved.
    pub fn closed(&self, error: TransportError) {
        let status = CloseStatus::from_transport_error(&error);
        let deliver = self.state.lock().on_close();
        if deliver {
            debug!(url = %self.url, reason = %status.reason, code = status.code, "socket closed");
            self.with_delegate(|d| d.on_closed(&status));
        }
    }

    /// A factory write completed.
    pub fn completed_write(&self, byte_count: usize) {
        let result = (|| -> SocketResult<()> {
            self.state.lock().check_connected("completedWrite")?;
            self.with_delegate(|d| d.on_write_completed(byte_count));
            Ok(())
        })();
        self.guard(result);
    }

    /// Data arrived from the transport.
    pub fn received(&self, data: &[u8]) {
        let result = (|| -> SocketResult<()> {
            self.state.lock().check_connected("receive")?;
            self.with_delegate(|d| d.on_received(data));
            Ok(())
        })();
        self.guard(result);
    }

    /// Whether the socket has fully closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// The HTTP handshake status, once received.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.state.lock().http_status()
    }

    fn guard(&self, result: SocketResult<()>) {
        if let Err(e) = result {
            warn!(url = %self.url, error = %e, "closing socket due to internal exception");
            let _ = self.close(CLOSE_INTERNAL_ERROR, "Internal exception");
        }
    }

    fn with_delegate(&self, f: impl FnOnce(&dyn SocketDelegate)) {
        let delegate = self.delegate.lock().as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            f(&*delegate);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(dispose) = &self.factory.dispose {
            dispose(self);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("role", &self.role)
            .field("url", &self.url)
            .field("framing", &self.factory.framing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseReason;
    use crate::factory::register_factory;

    #[derive(Debug, Clone, PartialEq)]
    enum FactoryEvent {
        Open,
        Write(Vec<u8>),
        CompletedReceive(usize),
        Close,
        RequestClose(i32, String),
        Dispose,
    }

    type FactoryLog = Arc<Mutex<Vec<FactoryEvent>>>;

    fn recording_factory(framing: Framing, log: &FactoryLog) -> SocketFactory {
        let mut factory = SocketFactory::new(framing);
        let l = Arc::clone(log);
        factory.open = Some(Box::new(move |_| l.lock().push(FactoryEvent::Open)));
        let l = Arc::clone(log);
        factory.write = Some(Box::new(move |_, bytes| {
            l.lock().push(FactoryEvent::Write(bytes.to_vec()));
        }));
        let l = Arc::clone(log);
        factory.completed_receive = Some(Box::new(move |_, n| {
            l.lock().push(FactoryEvent::CompletedReceive(n));
        }));
        match framing {
            Framing::Framed => {
                let l = Arc::clone(log);
                factory.close = Some(Box::new(move |_| l.lock().push(FactoryEvent::Close)));
            }
            Framing::Unframed => {
                let l = Arc::clone(log);
                factory.request_close = Some(Box::new(move |_, status, message| {
                    l.lock()
                        .push(FactoryEvent::RequestClose(status, message.to_string()));
                }));
            }
        }
        let l = Arc::clone(log);
        factory.dispose = Some(Box::new(move |_| l.lock().push(FactoryEvent::Dispose)));
        factory
    }

    #[derive(Debug, Clone, PartialEq)]
    enum DelegateEvent {
        HttpResponse(u16),
        Connected,
        Received(Vec<u8>),
        CloseRequested(i32, String),
        Closed(CloseReason, i32),
        WriteCompleted(usize),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DelegateEvent>>,
    }

    impl SocketDelegate for Recorder {
        fn on_got_http_response(&self, status: u16, _headers: &Value) {
            self.events.lock().push(DelegateEvent::HttpResponse(status));
        }
        fn on_connected(&self) {
            self.events.lock().push(DelegateEvent::Connected);
        }
        fn on_received(&self, data: &[u8]) {
            self.events
                .lock()
                .push(DelegateEvent::Received(data.to_vec()));
        }
        fn on_close_requested(&self, status: i32, message: &str) {
            self.events
                .lock()
                .push(DelegateEvent::CloseRequested(status, message.to_string()));
        }
        fn on_closed(&self, status: &CloseStatus) {
            self.events
                .lock()
                .push(DelegateEvent::Closed(status.reason, status.code));
        }
        fn on_write_completed(&self, byte_count: usize) {
            self.events
                .lock()
                .push(DelegateEvent::WriteCompleted(byte_count));
        }
    }

    fn opened_socket(framing: Framing) -> (Arc<Socket>, FactoryLog, Arc<Recorder>) {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(framing, &log);
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), Some(factory), None)
                .unwrap();
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn SocketDelegate> = recorder.clone();
        // The weak delegate stays upgradable while `recorder` is alive:
        // both Arcs share one allocation.
        socket.set_delegate(Arc::downgrade(&delegate));
        socket.connect().unwrap();
        socket.got_http_response(101, &Value::Map(Vec::new()));
        socket.opened();
        (socket, log, recorder)
    }

    #[test]
    fn connect_send_receive_round_trip() {
        let (socket, log, recorder) = opened_socket(Framing::Unframed);

        socket.send_bytes(b"hello").unwrap();
        socket.received(b"world");
        socket.receive_complete(5);
        socket.completed_write(5);

        let factory_events = log.lock().clone();
        assert_eq!(factory_events[0], FactoryEvent::Open);
        assert!(factory_events.contains(&FactoryEvent::Write(b"hello".to_vec())));
        assert!(factory_events.contains(&FactoryEvent::CompletedReceive(5)));

        let events = recorder.events.lock().clone();
        assert_eq!(events[0], DelegateEvent::HttpResponse(101));
        assert_eq!(events[1], DelegateEvent::Connected);
        assert!(events.contains(&DelegateEvent::Received(b"world".to_vec())));
        assert!(events.contains(&DelegateEvent::WriteCompleted(5)));
    }

    #[test]
    fn posix_error_maps_to_posix_close() {
        let (socket, _log, recorder) = opened_socket(Framing::Unframed);

        socket.closed(TransportError::posix(32, "Broken pipe"));
        let events = recorder.events.lock().clone();
        assert!(events.contains(&DelegateEvent::Closed(CloseReason::PosixError, 32)));
    }

    #[test]
    fn code_zero_maps_to_normal_close_and_fires_once() {
        let (socket, _log, recorder) = opened_socket(Framing::Unframed);

        socket.closed(TransportError::none());
        socket.closed(TransportError::none());
        let closes: Vec<_> = recorder
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::Closed(..)))
            .cloned()
            .collect();
        assert_eq!(
            closes,
            vec![DelegateEvent::Closed(CloseReason::WebSocketClose, 1000)]
        );
    }

    #[test]
    fn peer_close_request_is_acknowledged() {
        let (socket, log, recorder) = opened_socket(Framing::Unframed);

        socket.close_requested(1000, "going away");
        assert!(log
            .lock()
            .contains(&FactoryEvent::RequestClose(1000, "going away".into())));
        assert!(recorder
            .events
            .lock()
            .contains(&DelegateEvent::CloseRequested(1000, "going away".into())));

        socket.closed(TransportError::web_socket(1000, "going away"));
        assert!(recorder
            .events
            .lock()
            .contains(&DelegateEvent::Closed(CloseReason::WebSocketClose, 1000)));
    }

    #[test]
    fn crossing_closes_send_a_single_request() {
        let (socket, log, _recorder) = opened_socket(Framing::Unframed);

        socket.close(1000, "bye").unwrap();
        socket.close_requested(1000, "bye");

        let requests = log
            .lock()
            .iter()
            .filter(|e| matches!(e, FactoryEvent::RequestClose(..)))
            .count();
        assert_eq!(requests, 1);
    }

    #[test]
    fn framed_close_uses_close_slot() {
        let (socket, log, _recorder) = opened_socket(Framing::Framed);
        socket.close(1000, "done").unwrap();
        assert!(log.lock().contains(&FactoryEvent::Close));
    }

    #[test]
    fn inbound_fault_closes_with_1011() {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(Framing::Unframed, &log);
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), Some(factory), None)
                .unwrap();

        // `received` before the socket ever connected is an internal fault.
        socket.received(b"unexpected");
        assert!(log
            .lock()
            .contains(&FactoryEvent::RequestClose(1011, "Internal exception".into())));
    }

    #[test]
    fn handshake_rejection_closes_with_1011() {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(Framing::Unframed, &log);
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), Some(factory), None)
                .unwrap();
        socket.connect().unwrap();
        socket.got_http_response(401, &Value::Map(Vec::new()));
        socket.opened();
        assert_eq!(socket.http_status(), Some(401));
        assert!(log
            .lock()
            .contains(&FactoryEvent::RequestClose(1011, "Internal exception".into())));
    }

    #[test]
    fn from_native_builds_server_socket() {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(Framing::Unframed, &log);
        let socket = Socket::from_native(factory, Box::new(42usize), "wss://client").unwrap();
        assert_eq!(socket.role(), Role::Server);
        socket.with_native_handle(|handle| {
            assert_eq!(handle.unwrap().downcast_ref::<usize>(), Some(&42));
        });
    }

    #[test]
    fn options_are_parsed() {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(Framing::Unframed, &log);
        let options = Value::map(vec![
            (OPTION_WS_PROTOCOLS.into(), Value::Text("BLIP_3+CBMobile_3".into())),
            (OPTION_HEARTBEAT.into(), Value::Int(300)),
        ]);
        let socket = create_web_socket("wss://peer/db", options, Some(factory), None).unwrap();
        assert_eq!(socket.ws_protocols(), Some("BLIP_3+CBMobile_3"));
        assert_eq!(socket.heartbeat_secs(), Some(300));
    }

    #[test]
    fn registration_lifecycle() {
        // This is the only test that touches the process-global registry.
        assert!(matches!(
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), None, None),
            Err(SocketError::NoFactory)
        ));

        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        register_factory(recording_factory(Framing::Unframed, &log)).unwrap();

        // The registered factory is now the default.
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), None, None).unwrap();
        socket.connect().unwrap();
        assert_eq!(log.lock().first(), Some(&FactoryEvent::Open));

        // A second registration fails and leaves the first in place.
        let other: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            register_factory(recording_factory(Framing::Unframed, &other)),
            Err(SocketError::FactoryAlreadyRegistered)
        ));
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), None, None).unwrap();
        socket.connect().unwrap();
        assert!(other.lock().is_empty());
    }

    #[test]
    fn dispose_runs_on_drop() {
        let log: FactoryLog = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(Framing::Unframed, &log);
        let socket =
            create_web_socket("wss://peer/db", Value::Map(Vec::new()), Some(factory), None)
                .unwrap();
        drop(socket);
        assert!(log.lock().contains(&FactoryEvent::Dispose));
    }
}
