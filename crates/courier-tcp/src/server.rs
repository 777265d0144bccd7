//! TCP transport server.
//!
//! Lifecycle: `Idle → Listening → Closed`. Each accepted socket gets a
//! reader loop that decodes frames in arrival order and a writer task that
//! serializes replies. Handlers run on their own tasks, so a slow handler
//! does not hold up the next frame on the same socket. When the socket
//! closes, every handler still running for it is dropped.
//!
//! If the listener dies without `close()` being called, the server
//! re-listens after `retryDelay` for up to `retryAttempts` times over its
//! whole lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    ConnectionStatus, Deserializer, Dispatcher, EventOutcome, JsonDeserializer, JsonSerializer,
    MessageHandler, Packet, Pattern, ResponsePacket, Result, Serializer, StatusPublisher,
    Transport, TransportError, into_stream, is_transient_accept_error, response_packets,
};
use courier_settings::TcpOptions;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::codec::JsonSocketCodec;
use crate::connection::{Connection, OUTBOUND_BUFFER};
use crate::context::TcpContext;
use crate::retry::{CloseAction, RetryState};

/// How the server ended up permanently closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Manual,
    Lost,
    Exhausted { attempts: u32 },
}

/// Builder for [`TcpServer`].
pub struct TcpServerBuilder {
    options: TcpOptions,
    tls: Option<Arc<ServerConfig>>,
    serializer: Arc<dyn Serializer<ResponsePacket>>,
    deserializer: Arc<dyn Deserializer<Packet>>,
}

impl TcpServerBuilder {
    /// Builder with JSON serialization and TLS taken from `options`.
    pub fn new(options: TcpOptions) -> Self {
        Self {
            options,
            tls: None,
            serializer: Arc::new(JsonSerializer),
            deserializer: Arc::new(JsonDeserializer),
        }
    }

    /// Serve TLS with an already-built configuration.
    #[must_use]
    pub fn tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Replace the outbound serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn Serializer<ResponsePacket>>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replace the inbound deserializer.
    #[must_use]
    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer<Packet>>) -> Self {
        self.deserializer = deserializer;
        self
    }

    /// Build the server. Fails if configured TLS files cannot be loaded.
    pub fn build(self) -> Result<TcpServer> {
        let tls = match (self.tls, &self.options.tls_options) {
            (Some(config), _) => Some(config),
            (None, Some(files)) => Some(
                files
                    .server_config()
                    .map_err(|e| TransportError::config(e.to_string()))?,
            ),
            (None, None) => None,
        };
        let retry = RetryState::new(
            self.options.retry_attempts,
            Duration::from_millis(self.options.retry_delay),
        );
        let (terminal, _) = watch::channel(None);

        Ok(TcpServer {
            inner: Arc::new(Inner {
                options: self.options,
                tls: tls.map(TlsAcceptor::from),
                dispatcher: Dispatcher::new(),
                serializer: self.serializer,
                deserializer: self.deserializer,
                status: StatusPublisher::new(),
                retry: Mutex::new(retry),
                shutdown: CancellationToken::new(),
                listener_token: Mutex::new(CancellationToken::new()),
                bound: Mutex::new(None),
                accept_task: Mutex::new(None),
                connections: TaskTracker::new(),
                next_connection_id: AtomicU64::new(1),
                terminal,
            }),
        })
    }
}

/// TCP transport server.
pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: TcpOptions,
    tls: Option<TlsAcceptor>,
    dispatcher: Dispatcher<Value, TcpContext>,
    serializer: Arc<dyn Serializer<ResponsePacket>>,
    deserializer: Arc<dyn Deserializer<Packet>>,
    status: StatusPublisher<ConnectionStatus>,
    retry: Mutex<RetryState>,
    /// Cancelled by `close()`.
    shutdown: CancellationToken,
    /// Cancelled to drop the current listener without `close()`.
    listener_token: Mutex<CancellationToken>,
    bound: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: TaskTracker,
    next_connection_id: AtomicU64,
    terminal: watch::Sender<Option<Termination>>,
}

impl TcpServer {
    /// Server with default JSON codecs.
    pub fn new(options: TcpOptions) -> Result<Self> {
        TcpServerBuilder::new(options).build()
    }

    /// Start building a server.
    pub fn builder(options: TcpOptions) -> TcpServerBuilder {
        TcpServerBuilder::new(options)
    }

    /// Address of the current (or last) listening socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock()
    }

    /// Re-listen attempts consumed so far.
    pub fn retry_attempts(&self) -> u32 {
        self.inner.retry.lock().attempts()
    }

    /// The pattern registry.
    pub fn dispatcher(&self) -> &Dispatcher<Value, TcpContext> {
        &self.inner.dispatcher
    }

    /// Drop the current listener as if it failed underneath the server.
    #[cfg(test)]
    pub(crate) fn drop_listener(&self) {
        self.inner.listener_token.lock().cancel();
    }
}

#[async_trait]
impl Transport for TcpServer {
    type Payload = Value;
    type Context = TcpContext;

    fn add_handler(
        &self,
        pattern: Pattern,
        handler: Arc<dyn MessageHandler<Value, TcpContext>>,
        is_event: bool,
    ) {
        let _ = self.inner.dispatcher.add_handler(pattern, handler, is_event);
    }

    async fn listen(&self) -> Result<()> {
        if self.inner.accept_task.lock().is_some() {
            return Err(TransportError::config("server is already listening"));
        }
        let address = self.inner.options.address();
        let listener = self.inner.bind(&address).await?;
        Inner::start_accepting(&self.inner, listener);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.retry.lock().terminate();
        self.inner.shutdown.cancel();

        let accept_task = self.inner.accept_task.lock().take();
        if let Some(handle) = accept_task {
            let _ = handle.await;
        }
        let _ = self.inner.connections.close();
        self.inner.connections.wait().await;

        let _ = self.inner.status.set(ConnectionStatus::Disconnected);
        self.inner.terminate(Termination::Manual);
        info!("TCP server closed");
        Ok(())
    }

    async fn closed(&self) -> Result<()> {
        let mut rx = self.inner.terminal.subscribe();
        let termination = match rx.wait_for(Option::is_some).await {
            Ok(state) => *state,
            Err(_) => return Err(TransportError::Closed),
        };
        match termination {
            Some(Termination::Manual) | None => Ok(()),
            Some(Termination::Lost) => Err(TransportError::Closed),
            Some(Termination::Exhausted { attempts }) => {
                Err(TransportError::RetriesExhausted { attempts })
            }
        }
    }

    fn status(&self) -> &StatusPublisher<ConnectionStatus> {
        &self.inner.status
    }
}

impl Inner {
    async fn bind(&self, address: &str) -> Result<TcpListener> {
        match TcpListener::bind(address).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                *self.bound.lock() = Some(local);
                let _ = self.status.set(ConnectionStatus::Connected);
                info!(address = %local, tls = self.tls.is_some(), "TCP server listening");
                Ok(listener)
            }
            Err(source) => {
                let _ = self.status.set(ConnectionStatus::Disconnected);
                error!(address, error = %source, "TCP server failed to bind");
                Err(TransportError::Bind {
                    address: address.to_owned(),
                    source,
                })
            }
        }
    }

    fn start_accepting(this: &Arc<Self>, listener: TcpListener) {
        let token = CancellationToken::new();
        *this.listener_token.lock() = token.clone();
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move { inner.accept_loop(listener, token).await });
        *this.accept_task.lock() = Some(handle);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(error = %err, "accept failed, continuing");
                    }
                    Err(err) => {
                        error!(error = %err, "listener failed");
                        break;
                    }
                },
            }
        }
        drop(listener);
        self.handle_close();
    }

    fn handle_close(self: &Arc<Self>) {
        let _ = self.status.set(ConnectionStatus::Disconnected);
        let action = self.retry.lock().on_close();
        match action {
            CloseAction::Stop => {}
            CloseAction::NoRetry => {
                warn!("TCP listener closed unexpectedly");
                self.terminate(Termination::Lost);
            }
            CloseAction::Exhausted { attempts } => {
                error!(attempts, "retry budget exhausted, TCP server stays closed");
                self.terminate(Termination::Exhausted { attempts });
            }
            CloseAction::Relisten(delay) => {
                let address = self
                    .bound
                    .lock()
                    .map_or_else(|| self.options.address(), |addr| addr.to_string());
                info!(%address, delay_ms = delay.as_millis(), "scheduling re-listen");
                let inner = Arc::clone(self);
                let _ = tokio::spawn(async move {
                    tokio::select! {
                        () = inner.shutdown.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                    match inner.bind(&address).await {
                        Ok(listener) => Inner::start_accepting(&inner, listener),
                        Err(_) => inner.handle_close(),
                    }
                });
            }
        }
    }

    fn terminate(&self, termination: Termination) {
        let _ = self.terminal.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(termination);
                true
            } else {
                false
            }
        });
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let span = info_span!("tcp_connection", id, %peer);
        let _ = self.connections.spawn(
            async move {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "failed to set TCP_NODELAY");
                }
                match inner.tls.clone() {
                    Some(acceptor) => {
                        let handshake = tokio::select! {
                            () = inner.shutdown.cancelled() => return,
                            result = acceptor.accept(stream) => result,
                        };
                        match handshake {
                            Ok(tls) => inner.serve(tls, id, peer).await,
                            Err(err) => warn!(error = %err, "TLS handshake failed"),
                        }
                    }
                    None => inner.serve(stream, id, peer).await,
                }
            }
            .instrument(span),
        );
    }

    async fn serve<S>(self: Arc<Self>, stream: S, id: u64, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, JsonSocketCodec::new());
        let mut sink = FramedWrite::new(writer, JsonSocketCodec::new());

        let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
        let connection = Arc::new(Connection::new(id, peer, tx));
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(error = %err, "write failed, dropping connection");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        debug!("connection opened");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => self.dispatch(&connection, raw),
                    Some(Err(err)) => {
                        warn!(error = %err, "framing error, closing connection");
                        break;
                    }
                    None => break,
                },
            }
        }

        connection.close();
        let sent = connection.sent_count();
        drop(connection);
        if self.shutdown.is_cancelled() {
            writer_task.abort();
        } else {
            let _ = writer_task.await;
        }
        debug!(sent, "connection closed");
    }

    fn dispatch(self: &Arc<Self>, connection: &Arc<Connection>, raw: Value) {
        let packet = match self.deserializer.deserialize(raw) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "dropping undecodable packet");
                return;
            }
        };
        if packet.pattern.is_nil() {
            warn!("dropping packet without a pattern");
            return;
        }
        let inner = Arc::clone(self);
        let connection = Arc::clone(connection);
        let _ = self.connections.spawn(
            async move {
                tokio::select! {
                    () = inner.shutdown.cancelled() => {}
                    () = connection.closed() => debug!("connection closed, dropping handler"),
                    () = inner.handle_message(&connection, packet) => {}
                }
            }
            .in_current_span(),
        );
    }

    /// Route one decoded packet: events are drained silently, requests get
    /// one reply per produced value, the last one marked disposed.
    ///
    /// Runs until the reply stream ends; the caller races it against the
    /// connection and server lifetimes.
    async fn handle_message(&self, connection: &Connection, packet: Packet) {
        let route = packet.pattern.route();
        let ctx = TcpContext::new(connection.peer, route.clone());

        let Some(id) = packet.id else {
            match self.dispatcher.handle_event(&route, packet.data, ctx).await {
                EventOutcome::NoHandler => warn!(pattern = %route, "no handler for event"),
                EventOutcome::Failed(err) => {
                    error!(pattern = %route, error = %err, "event handler failed");
                }
                EventOutcome::Completed { .. } => debug!(pattern = %route, "event handled"),
            }
            return;
        };

        let Some(entry) = self.dispatcher.get_handler(&route) else {
            debug!(pattern = %route, %id, "no handler for request");
            let _ = self.write(connection, &ResponsePacket::no_handler(id)).await;
            return;
        };

        debug!(pattern = %route, %id, "dispatching request");
        let stream = into_stream(entry.handler.handle(packet.data, ctx).await);
        let mut packets = std::pin::pin!(response_packets(id, stream));
        while let Some(reply) = packets.next().await {
            if !self.write(connection, &reply).await {
                debug!(id = %reply.id, "connection closed before reply completed");
                break;
            }
        }
    }

    async fn write(&self, connection: &Connection, packet: &ResponsePacket) -> bool {
        match self.serializer.serialize(packet) {
            Ok(frame) => connection.send(frame).await,
            Err(err) => {
                error!(id = %packet.id, error = %err, "failed to serialize response");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_core::{HandlerError, NO_MESSAGE_HANDLER, Reply, ResponseStatus, handler_fn};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    fn options(retry_attempts: u32, retry_delay: u64) -> TcpOptions {
        TcpOptions {
            host: "127.0.0.1".into(),
            port: 0,
            retry_attempts,
            retry_delay,
            tls_options: None,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    struct RawClient {
        frames: FramedRead<tokio::net::tcp::OwnedReadHalf, JsonSocketCodec>,
        sink: FramedWrite<tokio::net::tcp::OwnedWriteHalf, JsonSocketCodec>,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                frames: FramedRead::new(read, JsonSocketCodec::new()),
                sink: FramedWrite::new(write, JsonSocketCodec::new()),
            }
        }

        async fn send(&mut self, value: Value) {
            self.sink.send(value).await.unwrap();
        }

        async fn recv(&mut self) -> ResponsePacket {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
                .await
                .expect("timed out waiting for reply")
                .expect("connection closed")
                .unwrap();
            serde_json::from_value(frame).unwrap()
        }
    }

    async fn listening_server() -> (TcpServer, SocketAddr) {
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.add_handler(
            "sum".into(),
            handler_fn(|data: Value, _ctx: TcpContext| async move {
                let total: i64 = data
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or_default();
                Ok(Reply::Value(json!(total)))
            }),
            false,
        );
        server.add_handler(
            "count".into(),
            handler_fn(|data: Value, _ctx: TcpContext| async move {
                let n = data.as_i64().unwrap_or_default();
                Ok(Reply::values((1..=n).map(|i| json!(i))))
            }),
            false,
        );
        server.add_handler(
            "fail".into(),
            handler_fn(|_: Value, _ctx: TcpContext| async { Err(HandlerError::rpc("boom")) }),
            false,
        );
        server.listen().await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    // ── Request/response ──

    #[tokio::test]
    async fn single_value_reply_is_disposed() {
        let (server, addr) = listening_server().await;
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "sum", "data": [1, 2, 3], "id": "a"})).await;

        let reply = client.recv().await;
        assert_eq!(reply, ResponsePacket::value("a", json!(6), true));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn stream_reply_stamps_every_packet() {
        let (server, addr) = listening_server().await;
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "count", "data": 3, "id": "s"})).await;

        let replies = vec![client.recv().await, client.recv().await, client.recv().await];
        assert!(replies.iter().all(|r| r.id == "s"));
        assert_eq!(
            replies.iter().map(|r| r.disposed).collect::<Vec<_>>(),
            vec![None, None, Some(true)]
        );
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_pattern_gets_exactly_one_error() {
        let (server, addr) = listening_server().await;
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "nope", "data": 1, "id": "x"})).await;
        client.send(json!({"pattern": "sum", "data": [1], "id": "y"})).await;

        let first = client.recv().await;
        assert_eq!(first.id, "x");
        assert_eq!(first.status, ResponseStatus::Error);
        assert_eq!(first.err, Some(json!(NO_MESSAGE_HANDLER)));
        // The next frame belongs to the following request: no retries for "x".
        assert_eq!(client.recv().await.id, "y");
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn handler_error_becomes_terminal_err() {
        let (server, addr) = listening_server().await;
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "fail", "data": {}, "id": "f"})).await;

        let reply = client.recv().await;
        assert_eq!(reply.err, Some(json!("boom")));
        assert_eq!(reply.status, ResponseStatus::Error);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn structured_pattern_matches_regardless_of_key_order() {
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.add_handler(
            json!({"cmd": "echo", "v": 1}).into(),
            handler_fn(|data: Value, ctx: TcpContext| async move {
                Ok(Reply::Value(json!({"data": data, "pattern": ctx.pattern()})))
            }),
            false,
        );
        server.listen().await.unwrap();
        let mut client = RawClient::connect(server.local_addr().unwrap()).await;
        client
            .send(json!({"pattern": {"v": 1, "cmd": "echo"}, "data": "hi", "id": "1"}))
            .await;

        let reply = client.recv().await;
        assert_eq!(
            reply.response,
            Some(json!({"data": "hi", "pattern": r#"{"cmd":"echo","v":1}"#}))
        );
        server.close().await.unwrap();
    }

    // ── Events ──

    #[tokio::test]
    async fn event_without_handler_logs_warning_and_sends_nothing() {
        let (logs, _guard) = courier_logging::capture_logs();
        let (server, addr) = listening_server().await;
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "ghost", "data": 1})).await;
        client.send(json!({"pattern": "sum", "data": [2], "id": "after"})).await;

        assert_eq!(client.recv().await.id, "after");
        wait_until(|| logs.has_event(tracing::Level::WARN, "no handler for event")).await;
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn event_handler_runs_without_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.add_handler(
            "created".into(),
            handler_fn(move |data: Value, _ctx: TcpContext| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(data);
                    Ok(Reply::Empty)
                }
            }),
            true,
        );
        server.listen().await.unwrap();
        let mut client = RawClient::connect(server.local_addr().unwrap()).await;
        client.send(json!({"pattern": "created", "data": {"n": 7}})).await;

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(seen, Some(json!({"n": 7})));
        server.close().await.unwrap();
    }

    // ── Framing ──

    #[tokio::test]
    async fn corrupt_frame_closes_only_that_connection() {
        let (server, addr) = listening_server().await;
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"xx#{}").await.unwrap();

        let mut good = RawClient::connect(addr).await;
        good.send(json!({"pattern": "sum", "data": [4], "id": "ok"})).await;
        assert_eq!(good.recv().await.response, Some(json!(4)));
        server.close().await.unwrap();
    }

    // ── Lifecycle ──

    #[tokio::test]
    async fn status_follows_listen_and_close() {
        let server = TcpServer::new(options(0, 0)).unwrap();
        assert_eq!(server.status().current(), None);
        server.listen().await.unwrap();
        assert_eq!(server.status().current(), Some(ConnectionStatus::Connected));
        server.close().await.unwrap();
        assert_eq!(server.status().current(), Some(ConnectionStatus::Disconnected));
        server.closed().await.unwrap();
    }

    #[tokio::test]
    async fn address_in_use_reports_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = TcpServer::new(TcpOptions {
            port,
            ..options(0, 0)
        })
        .unwrap();

        assert_matches!(server.listen().await, Err(TransportError::Bind { .. }));
        assert_eq!(server.status().current(), Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn two_retries_then_permanently_closed() {
        let server = TcpServer::new(options(2, 10)).unwrap();
        server.listen().await.unwrap();

        server.drop_listener();
        wait_until(|| {
            server.retry_attempts() == 1
                && server.status().current() == Some(ConnectionStatus::Connected)
        })
        .await;

        server.drop_listener();
        wait_until(|| {
            server.retry_attempts() == 2
                && server.status().current() == Some(ConnectionStatus::Connected)
        })
        .await;

        server.drop_listener();
        let closed = tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert_matches!(closed, Err(TransportError::RetriesExhausted { attempts: 2 }));
        assert_eq!(server.retry_attempts(), 2);
        assert_eq!(server.status().current(), Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn relisten_keeps_serving_on_same_address() {
        let (server, addr) = {
            let server = TcpServer::new(options(1, 10)).unwrap();
            server.add_handler(
                "ping".into(),
                handler_fn(|_: Value, _ctx: TcpContext| async { Ok(Reply::Value(json!("pong"))) }),
                false,
            );
            server.listen().await.unwrap();
            let addr = server.local_addr().unwrap();
            (server, addr)
        };

        server.drop_listener();
        wait_until(|| {
            server.retry_attempts() == 1
                && server.status().current() == Some(ConnectionStatus::Connected)
        })
        .await;

        assert_eq!(server.local_addr(), Some(addr));
        let mut client = RawClient::connect(addr).await;
        client.send(json!({"pattern": "ping", "data": 0, "id": "p"})).await;
        assert_eq!(client.recv().await.response, Some(json!("pong")));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn manual_close_never_retries() {
        let server = TcpServer::new(options(3, 10)).unwrap();
        server.listen().await.unwrap();
        server.close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.retry_attempts(), 0);
        assert!(server.closed().await.is_ok());
    }

    #[tokio::test]
    async fn lost_listener_without_budget_stays_closed() {
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.listen().await.unwrap();
        server.drop_listener();

        let closed = tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert_matches!(closed, Err(TransportError::Closed));
        assert_eq!(server.status().current(), Some(ConnectionStatus::Disconnected));
    }

    #[test]
    fn missing_tls_files_fail_at_build() {
        let opts = TcpOptions {
            tls_options: Some(courier_settings::TlsFiles {
                cert_path: "/nonexistent/cert.pem".into(),
                key_path: "/nonexistent/key.pem".into(),
            }),
            ..options(0, 0)
        };
        assert!(matches!(TcpServer::new(opts), Err(TransportError::Config { .. })));
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.listen().await.unwrap();
        let addr = server.local_addr();

        assert_matches!(server.listen().await, Err(TransportError::Config { .. }));
        assert_eq!(server.local_addr(), addr);
        server.close().await.unwrap();
    }

    // ── In-flight handlers ──

    /// Server whose `hang` handler returns a stream that never yields. The
    /// stream owns a clone of the returned `Arc`, so its strong count tells
    /// whether the stream is still alive.
    async fn hanging_server() -> (TcpServer, Arc<()>) {
        let held = Arc::new(());
        let captured = Arc::clone(&held);
        let server = TcpServer::new(options(0, 0)).unwrap();
        server.add_handler(
            "hang".into(),
            handler_fn(move |_: Value, _ctx: TcpContext| {
                let held = Arc::clone(&captured);
                async move {
                    Ok(Reply::stream(futures::stream::unfold(held, |held| async move {
                        let _held = held;
                        futures::future::pending::<
                            Option<(std::result::Result<Value, HandlerError>, Arc<()>)>,
                        >()
                        .await
                    })))
                }
            }),
            false,
        );
        server.listen().await.unwrap();
        (server, held)
    }

    #[tokio::test]
    async fn disconnect_drops_running_handlers() {
        let (server, held) = hanging_server().await;
        let mut client = RawClient::connect(server.local_addr().unwrap()).await;
        client.send(json!({"pattern": "hang", "data": null, "id": "h"})).await;
        wait_until(|| Arc::strong_count(&held) == 3).await;

        drop(client);
        wait_until(|| Arc::strong_count(&held) == 2).await;
        assert_eq!(server.status().current(), Some(ConnectionStatus::Connected));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_drops_running_handlers() {
        let (server, held) = hanging_server().await;
        let mut client = RawClient::connect(server.local_addr().unwrap()).await;
        client.send(json!({"pattern": "hang", "data": null, "id": "h"})).await;
        wait_until(|| Arc::strong_count(&held) == 3).await;

        tokio::time::timeout(Duration::from_secs(5), server.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Arc::strong_count(&held), 2);
    }
}
