//! What gRPC handlers receive.

use courier_core::HandlerError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::metadata::MetadataMap;

use crate::errors::error_from_status;
use crate::sink::ResponseSink;
use crate::subject::InboundStream;

/// Per-call context.
#[derive(Debug, Clone)]
pub struct GrpcContext {
    path: String,
    metadata: MetadataMap,
    cancellation: CancellationToken,
}

impl GrpcContext {
    /// Context for a call to `path`.
    pub fn new(path: impl Into<String>, metadata: MetadataMap, cancellation: CancellationToken) -> Self {
        Self {
            path: path.into(),
            metadata,
            cancellation,
        }
    }

    /// Method path, e.g. `/hero.HeroService/FindOne`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Cancelled when the peer goes away or the server is force-closed.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Request handed to a gRPC handler, shaped by the handler's streaming
/// style.
#[derive(Debug)]
pub enum GrpcPayload {
    /// The single request message of a `no_stream` handler.
    Message(Value),
    /// The request stream of an `rx_stream` handler.
    Stream(InboundStream),
    /// The raw call of a `pt_stream` handler.
    Call(GrpcCall),
}

impl GrpcPayload {
    /// The request message, if this is a `no_stream` payload.
    pub fn into_message(self) -> Option<Value> {
        match self {
            Self::Message(value) => Some(value),
            _ => None,
        }
    }

    /// The request stream, if this is an `rx_stream` payload.
    pub fn into_stream(self) -> Option<InboundStream> {
        match self {
            Self::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// The raw call, if this is a `pt_stream` payload.
    pub fn into_call(self) -> Option<GrpcCall> {
        match self {
            Self::Call(call) => Some(call),
            _ => None,
        }
    }
}

/// A pass-through call: the handler reads requests and, for
/// response-streaming methods, writes responses itself.
///
/// For methods with a single response, the last value the handler
/// produces is the reply.
pub struct GrpcCall {
    inbound: Streaming<Value>,
    sink: Option<ResponseSink>,
}

impl GrpcCall {
    pub(crate) fn new(inbound: Streaming<Value>, sink: Option<ResponseSink>) -> Self {
        Self { inbound, sink }
    }

    /// Next request message; `None` once the client finished sending.
    pub async fn message(&mut self) -> Result<Option<Value>, HandlerError> {
        self.inbound
            .message()
            .await
            .map_err(|status| error_from_status(&status))
    }

    /// Response sink, present for response-streaming methods.
    pub fn sink(&self) -> Option<&ResponseSink> {
        self.sink.as_ref()
    }
}

impl std::fmt::Debug for GrpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcCall")
            .field("streaming_response", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
