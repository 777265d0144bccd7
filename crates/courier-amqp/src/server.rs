//! AMQP transport server.
//!
//! A connection manager task owns the broker session: it cycles through the
//! configured URLs, re-runs channel setup on every new channel, and gives
//! up after `maxConnectionAttempts` consecutive failures that happen before
//! the first channel was ever opened. Once a channel has existed, failures
//! are treated as reconnects and retried forever.
//!
//! Deliveries are handled on tracked tasks tied to the channel they arrived
//! on. Losing the channel, or closing the server, drops them.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::errors::CONNECTION_FAILED_MESSAGE;
use courier_core::{
    ConnectionStatus, Deserializer, Dispatcher, EventOutcome,
    JsonDeserializer, JsonSerializer, MessageHandler, Packet, Pattern, RegisteredHandler,
    ResponsePacket, Result, Serializer, StatusPublisher, Transport, TransportError,
    WildcardRouter, into_stream, response_packets,
};
use courier_settings::AmqpOptions;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream};
use crate::context::AmqpContext;
use crate::errors::{BrokerError, redact_url};
use crate::lapin_broker::LapinConnector;

type Entry = RegisteredHandler<Value, AmqpContext>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Termination {
    Manual,
    Failed(String),
}

/// Builder for [`AmqpServer`].
pub struct AmqpServerBuilder {
    options: AmqpOptions,
    connector: Arc<dyn BrokerConnector>,
    serializer: Arc<dyn Serializer<ResponsePacket>>,
    deserializer: Arc<dyn Deserializer<Packet>>,
}

impl AmqpServerBuilder {
    /// Builder connecting through `lapin`, with JSON codecs.
    pub fn new(options: AmqpOptions) -> Self {
        Self {
            options,
            connector: Arc::new(LapinConnector),
            serializer: Arc::new(JsonSerializer),
            deserializer: Arc::new(JsonDeserializer),
        }
    }

    /// Use another broker connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the reply serializer.
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

    /// Build the server.
    pub fn build(self) -> Result<AmqpServer> {
        if self.options.urls.is_empty() {
            return Err(TransportError::config("at least one broker URL is required"));
        }
        if self.options.queue.is_empty() {
            return Err(TransportError::config("queue name must not be empty"));
        }
        let (terminal, _) = watch::channel(None);

        Ok(AmqpServer {
            inner: Arc::new(Inner {
                options: self.options,
                connector: self.connector,
                dispatcher: Dispatcher::new(),
                wildcards: RwLock::new(WildcardRouter::default()),
                serializer: self.serializer,
                deserializer: self.deserializer,
                status: StatusPublisher::new(),
                channel: Mutex::new(None),
                had_channel: AtomicBool::new(false),
                connection_attempts: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
                deliveries: TaskTracker::new(),
                manager: Mutex::new(None),
                terminal,
            }),
        })
    }
}

/// AMQP transport server.
pub struct AmqpServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: AmqpOptions,
    connector: Arc<dyn BrokerConnector>,
    dispatcher: Dispatcher<Value, AmqpContext>,
    wildcards: RwLock<WildcardRouter<Entry>>,
    serializer: Arc<dyn Serializer<ResponsePacket>>,
    deserializer: Arc<dyn Deserializer<Packet>>,
    status: StatusPublisher<ConnectionStatus>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    /// Set once the first channel opens; later failures are reconnects.
    had_channel: AtomicBool,
    connection_attempts: AtomicU32,
    shutdown: CancellationToken,
    /// Delivery handlers of every session.
    deliveries: TaskTracker,
    manager: Mutex<Option<JoinHandle<()>>>,
    terminal: watch::Sender<Option<Termination>>,
}

impl AmqpServer {
    /// Server connecting through `lapin`.
    pub fn new(options: AmqpOptions) -> Result<Self> {
        AmqpServerBuilder::new(options).build()
    }

    /// Start building a server.
    pub fn builder(options: AmqpOptions) -> AmqpServerBuilder {
        AmqpServerBuilder::new(options)
    }

    /// Failed connection attempts counted against `maxConnectionAttempts`.
    pub fn connection_attempts(&self) -> u32 {
        self.inner.connection_attempts.load(Ordering::SeqCst)
    }

    /// The pattern registry.
    pub fn dispatcher(&self) -> &Dispatcher<Value, AmqpContext> {
        &self.inner.dispatcher
    }

    /// The options this server was built with.
    pub fn options(&self) -> &AmqpOptions {
        &self.inner.options
    }
}

#[async_trait]
impl Transport for AmqpServer {
    type Payload = Value;
    type Context = AmqpContext;

    fn add_handler(
        &self,
        pattern: Pattern,
        handler: Arc<dyn MessageHandler<Value, AmqpContext>>,
        is_event: bool,
    ) {
        let _ = self.inner.dispatcher.add_handler(pattern, handler, is_event);
    }

    async fn listen(&self) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut manager = self.inner.manager.lock();
            if manager.is_some() {
                return Err(TransportError::config("server is already listening"));
            }
            let _ = self.inner.status.set(ConnectionStatus::Connecting);
            *manager = Some(tokio::spawn(Arc::clone(&self.inner).run(ready_tx)));
        }
        ready_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let manager = self.inner.manager.lock().take();
        if let Some(handle) = manager {
            let _ = handle.await;
        }
        let _ = self.inner.deliveries.close();
        self.inner.deliveries.wait().await;
        let channel = self.inner.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "channel close failed");
            }
        }
        let _ = self.inner.status.set(ConnectionStatus::Disconnected);
        self.inner.terminate(Termination::Manual);
        info!(queue = %self.inner.options.queue, "AMQP server closed");
        Ok(())
    }

    async fn closed(&self) -> Result<()> {
        let mut rx = self.inner.terminal.subscribe();
        let termination = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(TransportError::Closed),
        };
        match termination {
            Some(Termination::Failed(message)) => Err(TransportError::Connect { message }),
            Some(Termination::Manual) | None => Ok(()),
        }
    }

    fn status(&self) -> &StatusPublisher<ConnectionStatus> {
        &self.inner.status
    }
}

impl Inner {
    async fn run(self: Arc<Self>, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let reconnect = Duration::from_secs(self.options.socket_options.reconnect_time_in_seconds);
        let limit = self.options.connection_attempt_limit();

        for url in self.options.urls.iter().cycle() {
            let connected = tokio::select! {
                () = self.shutdown.cancelled() => return,
                result = self.connector.connect(url, &self.options.socket_options) => result,
            };
            match connected {
                Ok(session) => {
                    info!(url = %redact_url(url), queue = %self.options.queue, "connected to broker");
                    if self.serve_session(session, &mut ready).await.is_break() {
                        return;
                    }
                }
                Err(err) => {
                    if let Some(attempts) = self.on_connect_failed(&err, limit) {
                        self.give_up(&err, attempts, ready.take());
                        return;
                    }
                }
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(reconnect) => {}
            }
        }
    }

    /// Record a failed attempt. Returns the attempt count once the budget
    /// is spent.
    fn on_connect_failed(&self, err: &BrokerError, limit: Option<u32>) -> Option<u32> {
        let _ = self.status.set(ConnectionStatus::Disconnected);
        error!(error = %err, "{CONNECTION_FAILED_MESSAGE}");

        let max = limit?;
        if self.had_channel.load(Ordering::SeqCst) {
            return None;
        }
        let attempts = self.connection_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        (attempts >= max).then_some(attempts)
    }

    fn give_up(&self, err: &BrokerError, attempts: u32, ready: Option<oneshot::Sender<Result<()>>>) {
        error!(attempts, "maximum connection attempts reached, closing AMQP server");
        let _ = self.status.set(ConnectionStatus::Disconnected);
        let message = err.to_string();
        self.terminate(Termination::Failed(message.clone()));
        if let Some(tx) = ready {
            let _ = tx.send(Err(TransportError::Connect { message }));
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

    /// Set up the channel and consume until the connection drops.
    async fn serve_session(
        self: &Arc<Self>,
        session: BrokerSession,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> ControlFlow<()> {
        let BrokerSession { channel, mut lost } = session;
        // Cancelled on every exit path, ending the deliveries of this channel.
        let session = self.shutdown.child_token();
        let _session_guard = session.clone().drop_guard();
        let _ = self.status.set(ConnectionStatus::Connected);
        self.had_channel.store(true, Ordering::SeqCst);
        *self.channel.lock() = Some(Arc::clone(&channel));

        let mut deliveries = match self.setup_channel(channel.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = %err, "channel setup failed");
                let _ = channel.close().await;
                let _ = self.status.set(ConnectionStatus::Disconnected);
                return ControlFlow::Continue(());
            }
        };
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return ControlFlow::Break(()),
                err = &mut lost => {
                    let _ = self.status.set(ConnectionStatus::Disconnected);
                    error!(error = %err, "disconnected from broker");
                    return ControlFlow::Continue(());
                }
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => {
                        let inner = Arc::clone(self);
                        let channel = Arc::clone(&channel);
                        let session = session.clone();
                        let _ = self.deliveries.spawn(async move {
                            let tag = delivery.delivery_tag;
                            tokio::select! {
                                () = session.cancelled() => {
                                    debug!(delivery_tag = tag, "channel gone, dropping delivery");
                                }
                                () = inner.handle_delivery(channel, delivery) => {}
                            }
                        });
                    }
                    None => {
                        let _ = self.status.set(ConnectionStatus::Disconnected);
                        warn!("consumer cancelled by broker");
                        return ControlFlow::Continue(());
                    }
                },
            }
        }
    }

    async fn setup_channel(
        &self,
        channel: &dyn BrokerChannel,
    ) -> std::result::Result<DeliveryStream, BrokerError> {
        let opts = &self.options;
        if !opts.queue_options.no_assert {
            channel.assert_queue(&opts.queue, &opts.queue_options).await?;
        }
        if opts.uses_exchange() {
            let exchange = opts.exchange_name();
            channel.assert_exchange(exchange, &opts.exchange_type).await?;
            if let Some(routing_key) = &opts.routing_key {
                channel.bind_queue(&opts.queue, exchange, routing_key).await?;
            }
            if opts.wildcards {
                let patterns = self.dispatcher.patterns();
                let _ = futures::future::try_join_all(
                    patterns
                        .iter()
                        .map(|pattern| channel.bind_queue(&opts.queue, exchange, pattern)),
                )
                .await?;
                self.rebuild_wildcards();
            }
        }
        channel
            .prefetch(opts.prefetch_count, opts.is_global_prefetch_count)
            .await?;
        let deliveries = channel
            .consume(&opts.queue, opts.consumer_tag.as_deref(), opts.no_ack)
            .await?;
        debug!(queue = %opts.queue, no_ack = opts.no_ack, prefetch = opts.prefetch_count, "consuming");
        Ok(deliveries)
    }

    fn rebuild_wildcards(&self) {
        let router = WildcardRouter::from_patterns(
            self.dispatcher
                .entries()
                .into_iter()
                .map(|(pattern, entry)| (pattern, Arc::new(entry))),
        );
        debug!(count = router.len(), "compiled wildcard routes");
        *self.wildcards.write() = router;
    }

    /// Exact match first, then wildcard entries in registration order.
    fn resolve(&self, route: &str) -> Option<Entry> {
        if let Some(entry) = self.dispatcher.get_handler(route) {
            return Some(entry);
        }
        if !self.options.wildcards {
            return None;
        }
        self.wildcards
            .read()
            .find(route)
            .map(|found| (*found.handler).clone())
    }

    fn decode(&self, delivery: &Delivery) -> Result<Packet> {
        let raw = parse_body(&delivery.body);
        if raw.get("pattern").is_some_and(|p| !p.is_null()) {
            return self.deserializer.deserialize(raw);
        }
        Ok(Packet {
            pattern: Pattern::Route(delivery.routing_key.clone()),
            data: raw,
            id: None,
        })
    }

    async fn handle_delivery(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let packet = match self.decode(&delivery) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, delivery_tag = tag, "dropping undecodable message");
                self.reject(channel.as_ref(), tag).await;
                return;
            }
        };
        let route = packet.pattern.route();
        let ctx = AmqpContext::new(&delivery, route.clone(), Arc::clone(&channel));
        let entry = self.resolve(&route);

        let Some(id) = packet.id else {
            match Dispatcher::run_event(&route, entry, packet.data, ctx).await {
                EventOutcome::NoHandler => {
                    warn!(pattern = %route, "no handler for event");
                    self.reject(channel.as_ref(), tag).await;
                }
                EventOutcome::Failed(err) => {
                    error!(pattern = %route, error = %err, "event handler failed");
                }
                EventOutcome::Completed { .. } => debug!(pattern = %route, "event handled"),
            }
            return;
        };

        let Some(reply_to) = delivery.reply_to.as_deref() else {
            warn!(pattern = %route, %id, "request without replyTo, dropping");
            self.reject(channel.as_ref(), tag).await;
            return;
        };
        let correlation_id = delivery.correlation_id.as_deref();

        let Some(entry) = entry else {
            warn!(pattern = %route, %id, "no handler for request");
            self.reject(channel.as_ref(), tag).await;
            let _ = self
                .publish(channel.as_ref(), reply_to, correlation_id, &ResponsePacket::no_handler(id))
                .await;
            return;
        };

        debug!(pattern = %route, %id, "dispatching request");
        let stream = into_stream(entry.handler.handle(packet.data, ctx).await);
        let mut packets = std::pin::pin!(response_packets(id, stream));
        while let Some(reply) = packets.next().await {
            if !self
                .publish(channel.as_ref(), reply_to, correlation_id, &reply)
                .await
            {
                break;
            }
        }
    }

    /// Nack without requeue, when acknowledgements are on.
    async fn reject(&self, channel: &dyn BrokerChannel, delivery_tag: u64) {
        if self.options.no_ack {
            return;
        }
        if let Err(err) = channel.nack(delivery_tag, false).await {
            warn!(delivery_tag, error = %err, "nack failed");
        }
    }

    async fn publish(
        &self,
        channel: &dyn BrokerChannel,
        reply_to: &str,
        correlation_id: Option<&str>,
        packet: &ResponsePacket,
    ) -> bool {
        let body = match self
            .serializer
            .serialize(packet)
            .and_then(|value| serde_json::to_vec(&value).map_err(TransportError::from))
        {
            Ok(body) => body,
            Err(err) => {
                error!(id = %packet.id, error = %err, "failed to serialize reply");
                return false;
            }
        };
        match channel
            .send_to_queue(reply_to, body, correlation_id.map(str::to_owned))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(id = %packet.id, reply_to, error = %err, "failed to publish reply");
                false
            }
        }
    }
}

/// JSON when the body parses, the raw text otherwise.
fn parse_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
