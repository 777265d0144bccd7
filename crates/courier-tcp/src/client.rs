//! Client proxy for a courier TCP server.
//!
//! One socket carries many concurrent requests. Each request gets a fresh
//! UUID and its replies are routed back by id; the reply stream ends at the
//! first terminal packet.

use std::sync::Arc;

use courier_core::{HandlerError, Packet, Pattern, ReplyStream, ResponsePacket, Result, TransportError};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt, stream};
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::JsonSocketCodec;
use crate::connection::OUTBOUND_BUFFER;

type PendingReplies = DashMap<String, mpsc::UnboundedSender<ResponsePacket>>;

/// Client connected to a single TCP server.
pub struct TcpClient {
    tx: mpsc::Sender<Value>,
    pending: Arc<PendingReplies>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpClient {
    /// Connect to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write, JsonSocketCodec::new());
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(error = %err, "client write failed");
                    break;
                }
            }
        });

        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());
        let routes = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read, JsonSocketCodec::new());
            while let Some(frame) = frames.next().await {
                let raw = match frame {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(error = %err, "client framing error");
                        break;
                    }
                };
                match serde_json::from_value::<ResponsePacket>(raw) {
                    Ok(packet) => route_reply(&routes, packet),
                    Err(err) => warn!(error = %err, "dropping malformed reply"),
                }
            }
            // Dropping the senders ends every outstanding reply stream.
            routes.clear();
        });

        Ok(Self {
            tx,
            pending,
            reader,
            writer,
        })
    }

    /// Send a request and stream back its replies.
    ///
    /// Fails with [`TransportError::InvalidMessage`] before any I/O when the
    /// pattern or data is `null`.
    pub async fn send(&self, pattern: impl Into<Pattern>, data: Value) -> Result<ReplyStream> {
        let id = Uuid::now_v7().to_string();
        let packet = Packet::request(pattern, data, id.clone())?;

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let _ = self.pending.insert(id.clone(), reply_tx);
        if let Err(err) = self.write(&packet).await {
            let _ = self.pending.remove(&id);
            return Err(err);
        }
        debug!(%id, pattern = %packet.pattern, "request sent");
        Ok(reply_stream(reply_rx))
    }

    /// Send an event. No reply is expected.
    pub async fn emit(&self, pattern: impl Into<Pattern>, data: Value) -> Result<()> {
        let packet = Packet::event(pattern, data)?;
        self.write(&packet).await
    }

    /// Requests still waiting for a terminal reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drop the socket. Outstanding reply streams end.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.clear();
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        let frame = serde_json::to_value(packet)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn route_reply(pending: &PendingReplies, packet: ResponsePacket) {
    if packet.is_terminal() {
        if let Some((_, tx)) = pending.remove(&packet.id) {
            let _ = tx.send(packet);
        }
    } else if let Some(tx) = pending.get(&packet.id) {
        let _ = tx.send(packet);
    } else {
        debug!(id = %packet.id, "reply for unknown request");
    }
}

fn reply_stream(rx: mpsc::UnboundedReceiver<ResponsePacket>) -> ReplyStream {
    let items = stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        let packet = rx.recv().await?;
        let next = (!packet.is_terminal()).then_some(rx);
        let item = match (packet.err, packet.response) {
            (Some(err), _) => Some(Err(HandlerError::Rpc(err))),
            (None, Some(value)) => Some(Ok(value)),
            (None, None) => None,
        };
        Some((item, next))
    });
    Box::pin(items.filter_map(|item| async move { item }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Accepts one client and answers each request with `replies(request)`.
    async fn scripted_server<F>(replies: F) -> std::net::SocketAddr
    where
        F: Fn(&Packet) -> Vec<ResponsePacket> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _ = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, write) = socket.into_split();
            let mut frames = FramedRead::new(read, JsonSocketCodec::new());
            let mut sink = FramedWrite::new(write, JsonSocketCodec::new());
            while let Some(Ok(raw)) = frames.next().await {
                let packet: Packet = serde_json::from_value(raw).unwrap();
                for reply in replies(&packet) {
                    sink.send(serde_json::to_value(reply).unwrap()).await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_collects_stream_until_disposed() {
        let addr = scripted_server(|packet| {
            let id = packet.id.clone().unwrap();
            vec![
                ResponsePacket::value(id.clone(), json!(1), false),
                ResponsePacket::value(id, json!(2), true),
            ]
        })
        .await;
        let client = TcpClient::connect(addr).await.unwrap();

        let values: Vec<_> = client
            .send("count", json!(2))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].as_ref().unwrap(), &json!(2));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn err_packet_becomes_err_item() {
        let addr = scripted_server(|packet| {
            vec![ResponsePacket::no_handler(packet.id.clone().unwrap())]
        })
        .await;
        let client = TcpClient::connect(addr).await.unwrap();

        let values: Vec<_> = client.send("nope", json!(1)).await.unwrap().collect().await;
        assert_eq!(values.len(), 1);
        assert_matches!(&values[0], Err(HandlerError::Rpc(v)) if v.as_str() == Some(courier_core::NO_MESSAGE_HANDLER));
    }

    #[tokio::test]
    async fn disposed_marker_alone_yields_empty_stream() {
        let addr = scripted_server(|packet| {
            vec![ResponsePacket::disposed(packet.id.clone().unwrap())]
        })
        .await;
        let client = TcpClient::connect(addr).await.unwrap();

        let values: Vec<_> = client.send("noop", json!({})).await.unwrap().collect().await;
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn null_inputs_are_rejected_before_io() {
        let addr = scripted_server(|_| panic!("nothing should be sent")).await;
        let client = TcpClient::connect(addr).await.unwrap();

        assert!(matches!(
            client.send("sum", Value::Null).await,
            Err(TransportError::InvalidMessage)
        ));
        assert_matches!(
            client.emit(Value::Null, json!(1)).await,
            Err(TransportError::InvalidMessage)
        );
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            TcpClient::connect(addr).await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[test]
    fn interleaved_replies_route_by_id() {
        let pending = PendingReplies::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let _ = pending.insert("a".into(), a_tx);
        let _ = pending.insert("b".into(), b_tx);

        route_reply(&pending, ResponsePacket::value("b", json!(1), false));
        route_reply(&pending, ResponsePacket::value("a", json!(2), true));

        assert_eq!(a_rx.try_recv().unwrap().response, Some(json!(2)));
        assert_eq!(b_rx.try_recv().unwrap().response, Some(json!(1)));
        assert!(!pending.contains_key("a"));
        assert!(pending.contains_key("b"));
    }
}
