//! The per-connection state machine.
//!
//! ```text
//! AwaitingHandshake -> Establishing -> Established -> Closing -> Closed
//! ```
//!
//! [`Connection`] itself does no I/O. Bytes read from the socket are fed to it; whatever it
//! wants to write goes through the [`Client`]'s command queue, which a dedicated writer task
//! drains in order. [`serve`] wires both halves to a socket.
use std::sync::Arc;

use ::http::{header, HeaderValue};
use bytes::BytesMut;
use futures::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::mpsc,
    time::Instant,
};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

use crate::{
    application::Application,
    client::{Client, ClientId, Closer, Command},
    close::CloseCode,
    codec::Encoder,
    frame::{Frame, FrameHeader, OpCode},
    handshake,
    http::{Request, RequestParser, Response},
    message::{Message, Payload},
    options::Limits,
    protocol::{Negotiator, Protocol, Rfc6455},
    registry::ClientRegistry,
    utf8, BoxError, Result, WebSocketError,
};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Buffering the upgrade request.
    AwaitingHandshake,
    /// Verifying the request and negotiating the protocol.
    Establishing,
    /// Exchanging frames.
    Established,
    /// A close frame was sent; inbound data is ignored.
    Closing,
    /// Terminal.
    Closed,
}

/// Everything connections of one server share.
pub(crate) struct Shared {
    pub app: Arc<dyn Application>,
    pub negotiator: Negotiator,
    pub registry: ClientRegistry,
    pub parser: RequestParser,
    pub limits: Limits,
}

/// State of one connection.
pub struct Connection {
    client: Arc<Client>,
    shared: Arc<Shared>,
    state: State,
    registered: bool,
    finished: bool,
    http_buffer: BytesMut,
    request: Option<Request>,
    protocol: Arc<dyn Protocol>,
    frame: Option<Frame>,
    message: Option<Message>,
}

impl Connection {
    pub(crate) fn new(client: Arc<Client>, shared: Arc<Shared>) -> Self {
        Self {
            client,
            shared,
            state: State::AwaitingHandshake,
            registered: false,
            finished: false,
            http_buffer: BytesMut::new(),
            request: None,
            protocol: Arc::new(Rfc6455),
            frame: None,
            message: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    fn id(&self) -> ClientId {
        self.client.id()
    }

    fn path(&self) -> &str {
        self.request.as_ref().map_or("-", Request::path)
    }

    /// Adds the client to the registry.
    pub(crate) fn register(&mut self) {
        match self
            .shared
            .registry
            .add(self.id(), Arc::clone(&self.client))
        {
            Ok(()) => self.registered = true,
            Err(err) => self.on_internal_error(err),
        }
    }

    /// Feeds bytes read from the socket.
    pub(crate) fn on_data(&mut self, data: &[u8]) {
        self.sync_closing();
        match self.state {
            State::AwaitingHandshake => self.on_http_data(data),
            State::Established => self.on_ws_data(BytesMut::from(data)),
            State::Establishing | State::Closing | State::Closed => {
                log::trace!("conn={} ignoring {} bytes in {:?}", self.id(), data.len(), self.state);
            }
        }
    }

    /// The client did not finish its upgrade request in time.
    pub(crate) fn on_handshake_timeout(&mut self) {
        if self.state == State::AwaitingHandshake {
            self.fail(WebSocketError::HandshakeTimeout);
        }
    }

    /// The socket is gone. Notifies the application, leaves the registry and stops the
    /// writer. Calling it again does nothing.
    pub(crate) fn on_end(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.client.is_established() {
            if let Some(request) = self.request.as_ref() {
                if let Err(err) = self.shared.app.handle_close(&self.client, request) {
                    log::error!("conn={} path={} close handler failed: {err}", self.id(), self.path());
                }
            }
        }

        if self.registered && self.shared.registry.remove(self.id()) {
            log::debug!("conn={} removed from registry", self.id());
        }

        self.client.mark_closing();
        let _ = self.client.shutdown();
        self.state = State::Closed;
    }

    fn on_http_data(&mut self, data: &[u8]) {
        self.http_buffer.extend_from_slice(data);

        let parsed = self
            .shared
            .parser
            .parse(&self.http_buffer, self.client.peer_addr());

        match parsed {
            Ok(None) => {}
            Ok(Some((request, consumed))) => {
                let leftover = self.http_buffer.split_off(consumed);
                self.http_buffer = BytesMut::new();
                self.establish(request);
                if self.state == State::Established && !leftover.is_empty() {
                    self.on_ws_data(leftover);
                }
            }
            Err(err) => self.fail(err),
        }
    }

    fn establish(&mut self, request: Request) {
        self.state = State::Establishing;
        log::debug!(
            "conn={} upgrade request {} {} from {:?}",
            self.id(),
            request.method(),
            request.target(),
            request.client_ip()
        );

        self.client.set_request(request.clone());
        let result = self.upgrade(&request);
        self.request = Some(request);

        match result {
            Ok(()) => {
                log::info!(
                    "conn={} established path={} protocol={}",
                    self.id(),
                    self.path(),
                    self.protocol.name()
                );
                self.open();
            }
            Err(err) => self.handle_failure(err),
        }
    }

    fn upgrade(&mut self, request: &Request) -> Result<()> {
        self.shared.registry.get(self.id())?;

        let protocol = self.shared.negotiator.select(request)?;
        if !protocol.verify(request) {
            return Err(WebSocketError::HandshakeFailed);
        }

        let sub_protocol =
            handshake::negotiate_sub_protocol(request, &self.shared.app.sub_protocols());
        let response = protocol.handshake_response(request, sub_protocol.as_deref())?;
        self.client.write(response)?;

        if let Some(sub_protocol) = sub_protocol {
            self.client.set_sub_protocol(sub_protocol);
        }
        self.client.mark_established();
        self.protocol = protocol;
        self.state = State::Established;
        Ok(())
    }

    fn open(&mut self) {
        let result = match self.request.as_ref() {
            Some(request) => self.shared.app.handle_open(&self.client, request),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.on_app_error(err);
        }
    }

    fn on_ws_data(&mut self, data: BytesMut) {
        let mut next = self.read_frame(data);
        loop {
            match next {
                Ok(Some(overflow)) => {
                    self.sync_closing();
                    if self.state != State::Established {
                        return;
                    }
                    next = self.read_frame(overflow);
                }
                Ok(None) => return,
                Err(err) => return self.handle_failure(err),
            }
        }
    }

    /// Feeds bytes into the frame being assembled.
    ///
    /// Returns the bytes past its end once the frame is complete, so the caller can start the
    /// next one with them. A frame that starts with `data` takes ownership of it.
    fn read_frame(&mut self, data: BytesMut) -> Result<Option<BytesMut>> {
        match self.frame.as_mut() {
            Some(frame) => frame.add_buffer(&data),
            None => self.frame = Some(Frame::from(data)),
        }
        let Some(frame) = self.frame.as_mut() else {
            return Ok(None);
        };

        let Some(header) = frame.header()? else {
            return Ok(None);
        };
        self.protocol
            .validate_frame(&header, self.shared.limits.max_payload_read)?;

        if !frame.is_coalesced() {
            return Ok(None);
        }
        let overflow = frame.extract_overflow();

        let Some(mut frame) = self.frame.take() else {
            return Ok(overflow);
        };
        frame.unmask()?;
        self.on_frame(header, frame)?;

        Ok(overflow)
    }

    fn on_frame(&mut self, header: FrameHeader, frame: Frame) -> Result<()> {
        log::trace!(
            "conn={} frame {:?} fin={} len={}",
            self.id(),
            header.opcode,
            header.fin,
            header.payload_len
        );

        match header.opcode {
            OpCode::Continuation | OpCode::Text | OpCode::Binary => self.on_data_frame(frame),
            OpCode::Close => self.on_close_frame(&frame),
            OpCode::Ping => self.client.write(Frame::pong(frame.payload()?)),
            OpCode::Pong => Ok(()),
        }
    }

    fn on_data_frame(&mut self, frame: Frame) -> Result<()> {
        let message = self.message.get_or_insert_with(Message::new);
        message.add_frame(frame)?;

        if message.payload_len() > self.shared.limits.max_message_size {
            return Err(WebSocketError::FrameTooLarge);
        }
        if !message.is_coalesced() {
            return Ok(());
        }

        if let Some(message) = self.message.take() {
            let payload = message.into_payload()?;
            self.deliver(payload);
        }
        Ok(())
    }

    fn deliver(&mut self, payload: Payload) {
        let result = match self.request.as_ref() {
            Some(request) => self
                .shared
                .app
                .handle_message(&self.client, request, payload),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.on_app_error(err);
        }
    }

    /// Validates an inbound close frame and answers it with the same code.
    fn on_close_frame(&mut self, frame: &Frame) -> Result<()> {
        let payload = frame.payload()?;
        let code = match payload.len() {
            0 => None,
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                if !utf8::is_valid(&payload[2..]) {
                    return Err(WebSocketError::InvalidPayload);
                }
                Some(code)
            }
        };

        log::debug!("conn={} close frame received code={code:?}", self.id());

        if self.client.mark_closing() {
            let reply = match code {
                Some(code) => Frame::close(code, ""),
                None => Frame::close_raw(b""),
            };
            self.client.write(reply)?;
            self.client.shutdown()?;
        }
        self.state = State::Closing;
        Ok(())
    }

    /// Routes an error either to the peer-facing failure path or to the application.
    fn handle_failure(&mut self, err: WebSocketError) {
        if is_peer_error(&err) {
            self.fail(err);
        } else {
            self.on_internal_error(err);
        }
    }

    /// Fails the connection because of something the peer did.
    ///
    /// Before the upgrade the peer gets an HTTP error and the connection ends; afterwards it
    /// gets a close frame.
    fn fail(&mut self, err: WebSocketError) {
        log::debug!("conn={} path={} failed in {:?}: {err}", self.id(), self.path(), self.state);

        match self.state {
            State::AwaitingHandshake | State::Establishing => {
                let mut response = Response::error(err.status_code());
                if matches!(err, WebSocketError::UnsupportedProtocol) {
                    let versions = self.shared.negotiator.supported_versions();
                    if let Ok(versions) = HeaderValue::from_str(&versions) {
                        response = response.with_header(header::SEC_WEBSOCKET_VERSION, versions);
                    }
                }

                if self.client.mark_closing() {
                    let _ = self.client.write(response);
                    let _ = self.client.shutdown();
                }
                self.state = State::Closed;
            }
            State::Established => {
                if let Err(err) = self.client.close_with(err.close_code()) {
                    log::debug!("conn={} could not send close frame: {err}", self.id());
                }
                self.state = State::Closing;
            }
            State::Closing | State::Closed => {}
        }
    }

    fn on_app_error(&mut self, err: BoxError) {
        self.on_internal_error(WebSocketError::Application(err));
    }

    fn on_internal_error(&mut self, err: WebSocketError) {
        log::error!("conn={} path={} error: {err}", self.id(), self.path());
        self.shared
            .app
            .handle_error(&self.client, self.request.as_ref(), &err);
        self.sync_closing();
    }

    /// Follows a close initiated through the [`Client`].
    fn sync_closing(&mut self) {
        if !self.client.is_closing() {
            return;
        }
        match self.state {
            State::Established => self.state = State::Closing,
            State::AwaitingHandshake | State::Establishing => self.state = State::Closed,
            State::Closing | State::Closed => {}
        }
    }
}

/// `true` for errors caused by the peer, which are answered on the wire without involving the
/// application.
fn is_peer_error(err: &WebSocketError) -> bool {
    err.status_code() != ::http::StatusCode::INTERNAL_SERVER_ERROR
        || err.close_code() != CloseCode::Error
}

/// Drives a connection on `stream` until either side ends it.
pub(crate) async fn serve<S>(
    stream: S,
    client: Arc<Client>,
    rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = client.id();
    let (mut reader, writer) = tokio::io::split(stream);

    let done = CancellationToken::new();
    let writer_task = tokio::spawn(write_loop(writer, rx, done.clone(), id));

    let handshake_timeout = shared.limits.handshake_timeout;
    let mut connection = Connection::new(client, shared);
    connection.register();

    let deadline = tokio::time::sleep_until(
        handshake_timeout.map_or_else(Instant::now, |timeout| Instant::now() + timeout),
    );
    tokio::pin!(deadline);

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.clear();
        tokio::select! {
            _ = done.cancelled() => break,
            _ = &mut deadline, if handshake_timeout.is_some()
                && connection.state() == State::AwaitingHandshake =>
            {
                log::debug!("conn={id} handshake timed out");
                connection.on_handshake_timeout();
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    log::debug!("conn={id} peer closed the socket");
                    break;
                }
                Ok(_) => connection.on_data(&buf),
                Err(err) => {
                    log::debug!("conn={id} read failed: {err}");
                    break;
                }
            }
        }
    }

    connection.on_end();
    if let Err(err) = writer_task.await {
        log::error!("conn={id} writer task failed: {err}");
    }
}

/// Owns the write half: drains the command queue in order until a shutdown command.
async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Command>,
    done: CancellationToken,
    id: ClientId,
) where
    W: AsyncWrite + Send + Unpin,
{
    let _done = done.drop_guard();
    let mut sink = FramedWrite::new(writer, Encoder);

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(item) => {
                if let Err(err) = sink.send(item).await {
                    log::debug!("conn={id} write failed: {err}");
                    return;
                }
            }
            Command::Shutdown => break,
        }
    }

    if let Err(err) = sink.close().await {
        log::trace!("conn={id} shutdown failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Outbound, HandlerResult};
    use ::http::StatusCode;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail_messages: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl Application for Recorder {
        fn handle_open(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
            self.events
                .lock()
                .push(format!("open {} {}", client.id(), request.target()));
            Ok(())
        }

        fn handle_message(&self, _: &Arc<Client>, _: &Request, payload: Payload) -> HandlerResult {
            if self.fail_messages {
                return Err("handler refused".into());
            }
            let event = match payload {
                Payload::Text(text) => format!("text {text}"),
                Payload::Binary(bytes) => format!("binary {}", bytes.len()),
            };
            self.events.lock().push(event);
            Ok(())
        }

        fn handle_close(&self, client: &Arc<Client>, _: &Request) -> HandlerResult {
            self.events.lock().push(format!("close {}", client.id()));
            Ok(())
        }

        fn sub_protocols(&self) -> Vec<String> {
            vec!["chat".to_owned()]
        }
    }

    struct Harness {
        connection: Connection,
        rx: mpsc::UnboundedReceiver<Command>,
        app: Arc<Recorder>,
        registry: ClientRegistry,
    }

    fn harness_with(app: Recorder, limits: Limits) -> Harness {
        let app = Arc::new(app);
        let registry = ClientRegistry::default();
        let shared = Arc::new(Shared {
            app: app.clone(),
            negotiator: Negotiator::default(),
            registry: registry.clone(),
            parser: RequestParser::new(limits.max_request_size),
            limits,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client::new(ClientId::from(42), None, tx));
        let mut connection = Connection::new(client, shared);
        connection.register();

        Harness {
            connection,
            rx,
            app,
            registry,
        }
    }

    fn harness() -> Harness {
        harness_with(Recorder::default(), Limits::default())
    }

    fn upgrade_request(extra: &str) -> String {
        format!(
            "GET /chat?x=1 HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n"
        )
    }

    fn masked(payload: &str, fin: bool, opcode: OpCode) -> Vec<u8> {
        Frame::masked(payload, fin, opcode, [0x11, 0x22, 0x33, 0x44])
            .as_bytes()
            .to_vec()
    }

    impl Harness {
        fn establish(&mut self) {
            self.connection.on_data(upgrade_request("").as_bytes());
            assert_eq!(self.connection.state(), State::Established);
            let response = self.next_response();
            assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        }

        fn next(&mut self) -> Option<Command> {
            self.rx.try_recv().ok()
        }

        fn next_response(&mut self) -> Response {
            match self.next() {
                Some(Command::Write(Outbound::Response(response))) => response,
                other => panic!("expected a response, got {other:?}"),
            }
        }

        fn next_frame(&mut self) -> Frame {
            match self.next() {
                Some(Command::Write(Outbound::Frame(frame))) => frame,
                other => panic!("expected a frame, got {other:?}"),
            }
        }

        fn expect_close(&mut self, code: CloseCode) {
            let frame = self.next_frame();
            assert_eq!(frame.opcode().unwrap(), OpCode::Close);
            assert_eq!(frame.payload().unwrap(), &u16::from(code).to_be_bytes());
            assert!(matches!(self.next(), Some(Command::Shutdown)));
            assert_eq!(self.connection.state(), State::Closing);
        }
    }

    mod handshake_tests {
        use super::*;

        #[test]
        fn test_upgrade_in_pieces() {
            let mut h = harness();
            let request = upgrade_request("Sec-WebSocket-Protocol: mqtt, chat\r\n");
            for chunk in request.as_bytes().chunks(7) {
                assert_eq!(h.connection.state(), State::AwaitingHandshake);
                h.connection.on_data(chunk);
            }

            assert_eq!(h.connection.state(), State::Established);
            let response = h.next_response();
            assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
            assert_eq!(
                response.header(header::SEC_WEBSOCKET_ACCEPT),
                Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            );
            assert_eq!(response.header(header::SEC_WEBSOCKET_PROTOCOL), Some("chat"));
            assert_eq!(h.connection.client().sub_protocol(), Some("chat"));
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1"]);
            assert_eq!(
                h.connection.client().request().unwrap().query_pairs(),
                vec![("x".to_owned(), "1".to_owned())]
            );
        }

        #[test]
        fn test_request_too_large() {
            let mut h = harness();
            h.connection.on_data(&vec![b'a'; 5000]);

            assert_eq!(h.next_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
            assert!(matches!(h.next(), Some(Command::Shutdown)));
            assert_eq!(h.connection.state(), State::Closed);
            assert!(h.app.events().is_empty());
        }

        #[test]
        fn test_malformed_request() {
            let mut h = harness();
            h.connection.on_data(b"GET / HTTP/2.0\r\n\r\n");
            assert_eq!(h.next_response().status(), StatusCode::BAD_REQUEST);
            assert_eq!(h.connection.state(), State::Closed);
        }

        #[test]
        fn test_failed_verification() {
            let mut h = harness();
            let request = upgrade_request("").replace("Upgrade: websocket\r\n", "");
            h.connection.on_data(request.as_bytes());
            assert_eq!(h.next_response().status(), StatusCode::BAD_REQUEST);
            assert_eq!(h.connection.state(), State::Closed);
            assert!(!h.connection.client().is_established());
        }

        #[test]
        fn test_unsupported_version() {
            let mut h = harness();
            let request = upgrade_request("").replace("Version: 13", "Version: 99");
            h.connection.on_data(request.as_bytes());

            let response = h.next_response();
            assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
            assert_eq!(
                response.header(header::SEC_WEBSOCKET_VERSION),
                Some("13, 12, 11, 10, 9, 8, 7, 6")
            );
        }

        #[test]
        fn test_hybi_version_is_upgraded() {
            let mut h = harness();
            let request = upgrade_request("").replace("Version: 13", "Version: 8");
            h.connection.on_data(request.as_bytes());
            assert_eq!(h.connection.state(), State::Established);
        }

        #[test]
        fn test_handshake_timeout() {
            let mut h = harness();
            h.connection.on_data(b"GET /chat HTTP/1.1\r\n");
            h.connection.on_handshake_timeout();
            assert_eq!(h.next_response().status(), StatusCode::REQUEST_TIMEOUT);
            assert_eq!(h.connection.state(), State::Closed);
        }

        #[test]
        fn test_frames_in_same_read_as_request() {
            let mut h = harness();
            let mut bytes = upgrade_request("").into_bytes();
            bytes.extend(masked("early", true, OpCode::Text));
            h.connection.on_data(&bytes);

            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1", "text early"]);
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_text_message() {
            let mut h = harness();
            h.establish();
            h.connection.on_data(&masked("hello", true, OpCode::Text));
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1", "text hello"]);
        }

        #[test]
        fn test_frames_split_and_concatenated() {
            let mut h = harness();
            h.establish();

            let mut wire = masked("Hel", false, OpCode::Text);
            wire.extend(masked("lo", true, OpCode::Continuation));
            wire.extend(masked("second", true, OpCode::Text));
            wire.extend(Frame::masked(vec![7; 300], true, OpCode::Binary, [1, 2, 3, 4]).as_bytes());

            // odd-sized reads: frames and length prefixes straddle reads
            for chunk in wire.chunks(5) {
                h.connection.on_data(chunk);
            }

            assert_eq!(
                h.app.events(),
                vec!["open 42 /chat?x=1", "text Hello", "text second", "binary 300"]
            );
        }

        #[test]
        fn test_many_frames_in_one_read() {
            let mut h = harness();
            h.establish();

            let mut wire = Vec::new();
            for _ in 0..1000 {
                wire.extend(masked("", true, OpCode::Binary));
            }
            h.connection.on_data(&wire);

            let events = h.app.events();
            assert_eq!(events.len(), 1001);
            assert!(events[1..].iter().all(|event| event == "binary 0"));
        }

        #[test]
        fn test_ping_is_answered() {
            let mut h = harness();
            h.establish();
            h.connection.on_data(&masked("are you there", true, OpCode::Ping));

            let pong = h.next_frame();
            assert_eq!(pong.opcode().unwrap(), OpCode::Pong);
            assert!(!pong.is_masked().unwrap());
            assert_eq!(pong.payload().unwrap(), b"are you there");

            h.connection.on_data(&masked("", true, OpCode::Pong));
            assert!(h.next().is_none());
        }

        #[test]
        fn test_ping_between_fragments() {
            let mut h = harness();
            h.establish();

            let mut wire = masked("a", false, OpCode::Text);
            wire.extend(masked("p", true, OpCode::Ping));
            wire.extend(masked("b", true, OpCode::Continuation));
            h.connection.on_data(&wire);

            assert_eq!(h.next_frame().opcode().unwrap(), OpCode::Pong);
            assert_eq!(h.app.events().last().map(String::as_str), Some("text ab"));
        }

        #[test]
        fn test_close_is_echoed() {
            let mut h = harness();
            h.establish();

            let close = Frame::masked(1000u16.to_be_bytes(), true, OpCode::Close, [9, 9, 9, 9]);
            h.connection.on_data(close.as_bytes());
            h.expect_close(CloseCode::Normal);

            // ignored while closing
            h.connection.on_data(&masked("late", true, OpCode::Text));
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1"]);

            h.connection.on_end();
            assert_eq!(h.connection.state(), State::Closed);
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1", "close 42"]);
            assert!(!h.registry.contains(ClientId::from(42)));
        }

        #[test]
        fn test_empty_close_is_echoed_empty() {
            let mut h = harness();
            h.establish();
            h.connection.on_data(&masked("", true, OpCode::Close));
            let frame = h.next_frame();
            assert_eq!(frame.opcode().unwrap(), OpCode::Close);
            assert!(frame.payload().unwrap().is_empty());
        }
    }

    mod violation_tests {
        use super::*;

        fn violation(wire: &[u8], code: CloseCode) {
            let mut h = harness();
            h.establish();
            h.connection.on_data(wire);
            h.expect_close(code);
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1"]);
        }

        #[test]
        fn test_unmasked_frame() {
            violation(Frame::text("plain").as_bytes(), CloseCode::Protocol);
        }

        #[test]
        fn test_reserved_bits() {
            let mut wire = masked("x", true, OpCode::Text);
            wire[0] |= 0x40;
            violation(&wire, CloseCode::Protocol);
        }

        #[test]
        fn test_payload_length_high_bit() {
            let mut wire = vec![0x82u8, 0xFF];
            wire.extend_from_slice(&u64::MAX.to_be_bytes());
            wire.extend_from_slice(&[1, 2, 3, 4]);
            violation(&wire, CloseCode::Protocol);
        }

        #[test]
        fn test_reserved_opcode() {
            violation(&[0x83, 0x80, 0, 0, 0, 0], CloseCode::Protocol);
        }

        #[test]
        fn test_fragmented_control_frame() {
            violation(&masked("x", false, OpCode::Ping), CloseCode::Protocol);
        }

        #[test]
        fn test_oversized_control_frame() {
            let wire = Frame::masked(vec![0; 126], true, OpCode::Ping, [1, 2, 3, 4]);
            violation(wire.as_bytes(), CloseCode::Protocol);
        }

        #[test]
        fn test_continuation_without_message() {
            violation(&masked("x", true, OpCode::Continuation), CloseCode::Protocol);
        }

        #[test]
        fn test_interleaved_data_frames() {
            let mut wire = masked("a", false, OpCode::Text);
            wire.extend(masked("b", true, OpCode::Text));
            violation(&wire, CloseCode::Protocol);
        }

        #[test]
        fn test_invalid_utf8() {
            let wire = Frame::masked([0xC3u8, 0x28], true, OpCode::Text, [1, 2, 3, 4]);
            violation(wire.as_bytes(), CloseCode::Invalid);
        }

        #[test]
        fn test_invalid_close_payloads() {
            violation(&masked("x", true, OpCode::Close), CloseCode::Protocol);

            let reserved = Frame::masked(1005u16.to_be_bytes(), true, OpCode::Close, [1, 2, 3, 4]);
            violation(reserved.as_bytes(), CloseCode::Protocol);

            let mut payload = 1000u16.to_be_bytes().to_vec();
            payload.extend_from_slice(&[0xFF, 0xFE]);
            let bad_reason = Frame::masked(payload, true, OpCode::Close, [1, 2, 3, 4]);
            violation(bad_reason.as_bytes(), CloseCode::Invalid);
        }

        #[test]
        fn test_frame_too_large() {
            let limits = Limits {
                max_payload_read: 16,
                ..Limits::default()
            };
            let mut h = harness_with(Recorder::default(), limits);
            h.establish();

            // only the header has to arrive for the limit to apply
            let wire = Frame::masked(vec![0; 17], true, OpCode::Binary, [1, 2, 3, 4]);
            h.connection.on_data(&wire.as_bytes()[..6]);
            h.expect_close(CloseCode::Size);
        }

        #[test]
        fn test_message_too_large() {
            let limits = Limits {
                max_message_size: 8,
                ..Limits::default()
            };
            let mut h = harness_with(Recorder::default(), limits);
            h.establish();

            let mut wire = masked("12345", false, OpCode::Binary);
            wire.extend(masked("67890", true, OpCode::Continuation));
            h.connection.on_data(&wire);
            h.expect_close(CloseCode::Size);
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn test_application_error_closes_with_1011() {
            let app = Recorder {
                fail_messages: true,
                ..Recorder::default()
            };
            let mut h = harness_with(app, Limits::default());
            h.establish();

            h.connection.on_data(&masked("boom", true, OpCode::Text));
            h.expect_close(CloseCode::Error);
        }

        #[test]
        fn test_application_close_moves_to_closing() {
            let mut h = harness();
            h.establish();

            h.connection.client().close_with(CloseCode::Away).unwrap();
            h.expect_close_after_data();
        }

        #[test]
        fn test_end_before_handshake() {
            let mut h = harness();
            assert!(h.registry.contains(ClientId::from(42)));
            h.connection.on_data(b"GET /chat HTTP/1.1\r\n");
            h.connection.on_end();

            assert_eq!(h.connection.state(), State::Closed);
            assert!(h.app.events().is_empty());
            assert!(!h.registry.contains(ClientId::from(42)));
            assert!(matches!(h.next(), Some(Command::Shutdown)));
        }

        #[test]
        fn test_end_is_idempotent() {
            let mut h = harness();
            h.establish();
            h.connection.on_end();
            h.connection.on_end();
            assert_eq!(h.app.events(), vec!["open 42 /chat?x=1", "close 42"]);
        }

        #[test]
        fn test_missing_registry_entry_answers_500() {
            let mut h = harness();
            assert!(h.registry.remove(ClientId::from(42)));

            h.connection.on_data(upgrade_request("").as_bytes());

            assert_eq!(h.next_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(matches!(h.next(), Some(Command::Shutdown)));
            assert!(h.next().is_none());
            assert_eq!(h.connection.state(), State::Closed);
            assert!(h.app.events().is_empty());
        }

        #[test]
        fn test_duplicate_registration_is_rejected() {
            let h = harness();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let twin = Arc::new(Client::new(ClientId::from(42), None, tx));
            let mut connection = Connection::new(twin, h.connection.shared.clone());
            connection.register();

            match rx.try_recv() {
                Ok(Command::Write(Outbound::Response(response))) => {
                    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR)
                }
                other => panic!("expected a response, got {other:?}"),
            }
            assert_eq!(connection.state(), State::Closed);

            // the original entry survives the twin's end
            connection.on_end();
            assert!(h.registry.contains(ClientId::from(42)));
        }
    }

    impl Harness {
        fn expect_close_after_data(&mut self) {
            self.connection.on_data(&masked("ignored", true, OpCode::Text));
            self.expect_close(CloseCode::Away);
            assert_eq!(self.app.events(), vec!["open 42 /chat?x=1"]);
        }
    }
}
