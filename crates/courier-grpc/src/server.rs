//! gRPC transport server.
//!
//! Lifecycle: `Idle → Listening → Closed`. `listen` loads the service
//! definitions, resolves a handler for every method and binds the socket.
//! Each accepted connection is served over HTTP/2 by a `hyper` connection
//! driving the axum request router.
//!
//! On `close`, a graceful server stops accepting and lets in-flight calls
//! finish; otherwise every call is cancelled and connections are dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::Router;
use courier_core::{
    ConnectionStatus, Dispatcher, MessageHandler, Pattern, Result, StatusPublisher, Transport,
    TransportError, is_transient_accept_error,
};
use courier_settings::GrpcOptions;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::call::GrpcHandler;
use crate::context::{GrpcContext, GrpcPayload};
use crate::loader::{PackageDefinition, ProtoSource};
use crate::pattern::{GrpcStreaming, grpc_pattern};
use crate::routes::{CallRouter, build_routes};
use crate::sink::DEFAULT_HIGH_WATER_MARK;

/// How the server ended up permanently closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Manual,
    Lost,
}

/// Builder for [`GrpcServer`].
pub struct GrpcServerBuilder {
    options: GrpcOptions,
    definition: Option<PackageDefinition>,
    tls: Option<Arc<ServerConfig>>,
    high_water_mark: usize,
}

impl GrpcServerBuilder {
    /// Builder over `options`; definitions come from `protoPath` unless a
    /// package definition is supplied.
    pub fn new(options: GrpcOptions) -> Self {
        Self {
            options,
            definition: None,
            tls: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Serve a pre-built package definition instead of loading `protoPath`.
    #[must_use]
    pub fn package_definition(mut self, definition: impl Into<PackageDefinition>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    /// Serve TLS with an already-built configuration.
    #[must_use]
    pub fn tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Responses buffered per streaming call before the writer backs off.
    #[must_use]
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Build the server.
    ///
    /// Fails when both or neither of `protoPath` and a package definition
    /// are given, when no package is named, or when the configured
    /// credentials cannot be loaded.
    pub fn build(self) -> Result<GrpcServer> {
        let source = ProtoSource::select(&self.options, self.definition)?;
        if self.options.package.is_empty() {
            return Err(TransportError::config("at least one package is required"));
        }
        let tls = match (self.tls, &self.options.credentials) {
            (Some(config), _) => Some(config),
            (None, Some(files)) => Some(
                files
                    .server_config_with_alpn(vec![b"h2".to_vec()])
                    .map_err(|e| TransportError::config(e.to_string()))?,
            ),
            (None, None) => None,
        };
        let (terminal, _) = watch::channel(None);

        Ok(GrpcServer {
            inner: Arc::new(Inner {
                options: self.options,
                source,
                tls: tls.map(TlsAcceptor::from),
                high_water_mark: self.high_water_mark,
                dispatcher: Dispatcher::new(),
                status: StatusPublisher::new(),
                shutdown: CancellationToken::new(),
                bound: Mutex::new(None),
                accept_task: Mutex::new(None),
                connections: TaskTracker::new(),
                next_connection_id: AtomicU64::new(1),
                terminal,
            }),
        })
    }
}

/// gRPC transport server.
pub struct GrpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: GrpcOptions,
    source: ProtoSource,
    tls: Option<TlsAcceptor>,
    high_water_mark: usize,
    dispatcher: Dispatcher<GrpcPayload, GrpcContext>,
    status: StatusPublisher<ConnectionStatus>,
    /// Cancelled by `close()`.
    shutdown: CancellationToken,
    bound: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: TaskTracker,
    next_connection_id: AtomicU64,
    terminal: watch::Sender<Option<Termination>>,
}

impl GrpcServer {
    /// Server loading definitions from `protoPath`.
    pub fn new(options: GrpcOptions) -> Result<Self> {
        GrpcServerBuilder::new(options).build()
    }

    /// Start building a server.
    pub fn builder(options: GrpcOptions) -> GrpcServerBuilder {
        GrpcServerBuilder::new(options)
    }

    /// Address of the listening socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock()
    }

    /// The pattern registry.
    pub fn dispatcher(&self) -> &Dispatcher<GrpcPayload, GrpcContext> {
        &self.inner.dispatcher
    }

    /// Register `handler` for `service`/`rpc` with the given streaming style.
    pub fn add_method_handler(
        &self,
        service: &str,
        rpc: &str,
        streaming: GrpcStreaming,
        handler: GrpcHandler,
    ) {
        let _ = self
            .inner
            .dispatcher
            .add_handler(grpc_pattern(service, rpc, streaming), handler, false);
    }
}

#[async_trait]
impl Transport for GrpcServer {
    type Payload = GrpcPayload;
    type Context = GrpcContext;

    fn add_handler(
        &self,
        pattern: Pattern,
        handler: Arc<dyn MessageHandler<GrpcPayload, GrpcContext>>,
        is_event: bool,
    ) {
        let _ = self.inner.dispatcher.add_handler(pattern, handler, is_event);
    }

    async fn listen(&self) -> Result<()> {
        if self.inner.bound.lock().is_some() {
            return Err(TransportError::config("gRPC server is already listening"));
        }
        let router = match self.inner.router() {
            Ok(router) => router,
            Err(err) => {
                let _ = self.inner.status.set(ConnectionStatus::Disconnected);
                error!(error = %err, "failed to load gRPC services");
                return Err(err);
            }
        };
        let listener = self.inner.bind().await?;
        Inner::start_accepting(&self.inner, listener, router);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();

        let accept_task = self.inner.accept_task.lock().take();
        if let Some(handle) = accept_task {
            let _ = handle.await;
        }
        let _ = self.inner.connections.close();
        self.inner.connections.wait().await;

        let _ = self.inner.status.set(ConnectionStatus::Disconnected);
        self.inner.terminate(Termination::Manual);
        info!(
            graceful = self.inner.options.graceful_shutdown,
            "gRPC server closed"
        );
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
        }
    }

    fn status(&self) -> &StatusPublisher<ConnectionStatus> {
        &self.inner.status
    }
}

impl Inner {
    /// Load definitions and build the request router.
    fn router(&self) -> Result<Router> {
        let pool = self.source.load()?;
        let routes = build_routes(&pool, &self.options.package, &self.dispatcher)?;
        info!(
            packages = ?self.options.package,
            methods = routes.len(),
            "gRPC services loaded"
        );
        Ok(CallRouter {
            routes,
            shutdown: self.shutdown.clone(),
            graceful: self.options.graceful_shutdown,
            high_water_mark: self.high_water_mark,
            max_receive_message_length: self.options.max_receive_message_length,
            max_send_message_length: self.options.max_send_message_length,
            max_metadata_size: self.options.max_metadata_size,
        }
        .into_router())
    }

    async fn bind(&self) -> Result<TcpListener> {
        let address = self.options.url.as_str();
        match TcpListener::bind(address).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                *self.bound.lock() = Some(local);
                let _ = self.status.set(ConnectionStatus::Connected);
                info!(address = %local, tls = self.tls.is_some(), "gRPC server listening");
                Ok(listener)
            }
            Err(source) => {
                let _ = self.status.set(ConnectionStatus::Disconnected);
                error!(address, error = %source, "gRPC server failed to bind");
                Err(TransportError::Bind {
                    address: address.to_owned(),
                    source,
                })
            }
        }
    }

    fn start_accepting(this: &Arc<Self>, listener: TcpListener, router: Router) {
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move { inner.accept_loop(listener, router).await });
        *this.accept_task.lock() = Some(handle);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, router: Router) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, router.clone()),
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
        let _ = self.status.set(ConnectionStatus::Disconnected);
        self.terminate(Termination::Lost);
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

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, router: Router) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let span = info_span!("grpc_connection", id, %peer);
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
                            Ok(tls) => inner.serve(tls, router).await,
                            Err(err) => warn!(error = %err, "TLS handshake failed"),
                        }
                    }
                    None => inner.serve(stream, router).await,
                }
            }
            .instrument(span),
        );
    }

    async fn serve<S>(&self, stream: S, router: Router)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let channel = &self.options.channel_options;
        let mut builder = auto::Builder::new(TokioExecutor::new());
        let _ = builder
            .http2()
            .max_concurrent_streams(channel.max_concurrent_streams)
            .initial_stream_window_size(channel.initial_stream_window_size)
            .max_frame_size(channel.max_frame_size);

        let connection =
            builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
        tokio::pin!(connection);

        debug!("connection opened");
        let result = tokio::select! {
            result = connection.as_mut() => result,
            () = self.shutdown.cancelled() => {
                if !self.options.graceful_shutdown {
                    debug!("connection dropped on close");
                    return;
                }
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        match result {
            Ok(()) => debug!("connection closed"),
            Err(err) => debug!(error = %err, "connection ended with error"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
