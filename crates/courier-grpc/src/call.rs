//! Per-method call handling for the four gRPC method shapes.
//!
//! | request | response | `no_stream` / `rx_stream` handler | `pt_stream` handler |
//! |---|---|---|---|
//! | single | single | first produced value | n/a |
//! | single | stream | values through the backpressure writer | n/a |
//! | stream | single | last produced value | last produced value |
//! | stream | stream | values through the backpressure writer | handler writes the sink |

use std::sync::Arc;

use courier_core::{HandlerError, MessageHandler, ReplyStream, into_stream};
use futures::StreamExt;
use futures::future::BoxFuture;
use prost_reflect::MethodDescriptor;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::server::{
    ClientStreamingService, ServerStreamingService, StreamingService, UnaryService,
};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{Instrument, debug};

use crate::codec::empty_message;
use crate::context::{GrpcCall, GrpcContext, GrpcPayload};
use crate::errors::{error_from_status, status_from_error};
use crate::pattern::GrpcStreaming;
use crate::sink::{CallSink, ResponseSink, ResponseStream, write_to_sink};
use crate::subject::{BufferedSubject, buffered_subject};

/// Handler type used by the gRPC transport.
pub type GrpcHandler = Arc<dyn MessageHandler<GrpcPayload, GrpcContext>>;

/// A routed method.
pub struct MethodRoute {
    /// Wire path, `/package.Service/Method`.
    pub path: String,
    /// Method descriptor.
    pub method: MethodDescriptor,
    /// Streaming style of the resolved handler.
    pub streaming: GrpcStreaming,
    /// The handler.
    pub handler: GrpcHandler,
}

impl std::fmt::Debug for MethodRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRoute")
            .field("path", &self.path)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

/// One inbound call on a routed method.
#[derive(Clone)]
pub(crate) struct MethodCall {
    pub(crate) route: Arc<MethodRoute>,
    pub(crate) token: CancellationToken,
    pub(crate) high_water_mark: usize,
}

impl MethodCall {
    fn context(&self, metadata: MetadataMap) -> GrpcContext {
        GrpcContext::new(self.route.path.clone(), metadata, self.token.clone())
    }

    async fn invoke(&self, payload: GrpcPayload, ctx: GrpcContext) -> ReplyStream {
        into_stream(self.route.handler.handle(payload, ctx).await)
    }

    /// Run the handler on its own task and stream its values through `sink`.
    fn spawn_writer(&self, payload: GrpcPayload, ctx: GrpcContext, sink: ResponseSink, subject: Option<BufferedSubject>) {
        let call = self.clone();
        let _ = tokio::spawn(
            async move {
                let source = call.invoke(payload, ctx).await;
                if let Some(subject) = subject {
                    subject.drain_buffer();
                }
                let outcome = write_to_sink(source, &sink, &call.token).await;
                debug!(path = %call.route.path, ?outcome, "response stream finished");
            }
            .in_current_span(),
        );
    }

    /// Run a pass-through handler on its own task. The handler writes the
    /// sink itself; the sink is ended once the handler's sequence is done.
    fn spawn_pass_through(&self, inbound: Streaming<Value>, ctx: GrpcContext, sink: ResponseSink) {
        let call = self.clone();
        let _ = tokio::spawn(
            async move {
                let payload = GrpcPayload::Call(GrpcCall::new(inbound, Some(sink.clone())));
                let mut source = call.invoke(payload, ctx).await;
                loop {
                    tokio::select! {
                        biased;
                        () = call.token.cancelled() => break,
                        next = source.next() => match next {
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                sink.error(err);
                                break;
                            }
                            None => break,
                        },
                    }
                }
                sink.end();
                debug!(path = %call.route.path, "pass-through call finished");
            }
            .in_current_span(),
        );
    }

    /// Feed `inbound` into `subject` until the client finishes, fails or
    /// the call is cancelled.
    fn spawn_pump(&self, mut inbound: Streaming<Value>, subject: BufferedSubject) {
        let token = self.token.clone();
        let _ = tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            subject.complete();
                            return;
                        }
                        message = inbound.message() => message,
                    };
                    match message {
                        Ok(Some(value)) => subject.next(value),
                        Ok(None) => {
                            subject.complete();
                            return;
                        }
                        Err(status) if status.code() == Code::Cancelled => {
                            subject.complete();
                            return;
                        }
                        Err(status) => {
                            subject.error(error_from_status(&status));
                            return;
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }

    /// Reply of a client-streaming call with a single response.
    async fn single_reply(&self, inbound: Streaming<Value>, ctx: GrpcContext) -> Result<Value, Status> {
        let source = if self.route.streaming == GrpcStreaming::PtStream {
            let payload = GrpcPayload::Call(GrpcCall::new(inbound, None));
            self.invoke(payload, ctx).await
        } else {
            let (subject, stream) = buffered_subject();
            self.spawn_pump(inbound, subject.clone());
            let source = self.invoke(GrpcPayload::Stream(stream), ctx).await;
            subject.drain_buffer();
            source
        };
        last_value(source, &self.token).await
    }
}

/// First value of `source`. An empty sequence replies with the empty
/// message.
async fn first_value(mut source: ReplyStream, token: &CancellationToken) -> Result<Value, Status> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Status::cancelled("call cancelled")),
        next = source.next() => match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(status_from_error(&err)),
            None => Ok(empty_message()),
        },
    }
}

/// Last value of `source` before it completes. Cancellation yields no
/// reply.
async fn last_value(mut source: ReplyStream, token: &CancellationToken) -> Result<Value, Status> {
    let mut last = None;
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return Err(Status::cancelled("call cancelled")),
            next = source.next() => match next {
                Some(Ok(value)) => last = Some(value),
                Some(Err(HandlerError::Cancelled)) => {
                    return Err(Status::cancelled("call cancelled"));
                }
                Some(Err(err)) => return Err(status_from_error(&err)),
                None => break,
            },
        }
    }
    Ok(last.unwrap_or_else(empty_message))
}

impl UnaryService<Value> for MethodCall {
    type Response = Value;
    type Future = BoxFuture<'static, Result<Response<Value>, Status>>;

    fn call(&mut self, request: Request<Value>) -> Self::Future {
        let call = self.clone();
        Box::pin(async move {
            let guard = call.token.clone().drop_guard();
            let (metadata, _, message) = request.into_parts();
            let ctx = call.context(metadata);
            let source = call.invoke(GrpcPayload::Message(message), ctx).await;
            let reply = first_value(source, &call.token).await;
            let _ = guard.disarm();
            reply.map(Response::new)
        })
    }
}

impl ServerStreamingService<Value> for MethodCall {
    type Response = Value;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<'static, Result<Response<ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Value>) -> Self::Future {
        let call = self.clone();
        Box::pin(async move {
            let (metadata, _, message) = request.into_parts();
            let (sink, stream) = ResponseSink::channel(call.high_water_mark, call.token.clone());
            let ctx = call.context(metadata);
            call.spawn_writer(GrpcPayload::Message(message), ctx, sink, None);
            Ok(Response::new(stream))
        })
    }
}

impl ClientStreamingService<Value> for MethodCall {
    type Response = Value;
    type Future = BoxFuture<'static, Result<Response<Value>, Status>>;

    fn call(&mut self, request: Request<Streaming<Value>>) -> Self::Future {
        let call = self.clone();
        Box::pin(async move {
            let guard = call.token.clone().drop_guard();
            let (metadata, _, inbound) = request.into_parts();
            let ctx = call.context(metadata);
            let reply = call.single_reply(inbound, ctx).await;
            let _ = guard.disarm();
            reply.map(Response::new)
        })
    }
}

impl StreamingService<Value> for MethodCall {
    type Response = Value;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<'static, Result<Response<ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Value>>) -> Self::Future {
        let call = self.clone();
        Box::pin(async move {
            let (metadata, _, inbound) = request.into_parts();
            let (sink, stream) = ResponseSink::channel(call.high_water_mark, call.token.clone());
            let ctx = call.context(metadata);
            if call.route.streaming == GrpcStreaming::PtStream {
                call.spawn_pass_through(inbound, ctx, sink);
            } else {
                let (subject, inbound_stream) = buffered_subject();
                call.spawn_pump(inbound, subject.clone());
                call.spawn_writer(GrpcPayload::Stream(inbound_stream), ctx, sink, Some(subject));
            }
            Ok(Response::new(stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Reply;
    use futures::stream;
    use serde_json::json;

    fn values(items: Vec<Result<Value, HandlerError>>) -> ReplyStream {
        into_stream(Ok(Reply::stream(stream::iter(items))))
    }

    #[tokio::test]
    async fn first_value_takes_the_head() {
        let reply = first_value(values(vec![Ok(json!(1)), Ok(json!(2))]), &CancellationToken::new()).await;
        assert_eq!(reply.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn empty_reply_is_empty_message() {
        let reply = first_value(into_stream(Ok(Reply::Empty)), &CancellationToken::new()).await;
        assert_eq!(reply.unwrap(), json!({}));
        let reply = last_value(into_stream(Ok(Reply::Empty)), &CancellationToken::new()).await;
        assert_eq!(reply.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn first_value_maps_errors() {
        let reply = first_value(
            values(vec![Err(HandlerError::rpc(json!({"code": 5, "message": "nope"})))]),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reply.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn last_value_waits_for_completion() {
        let reply = last_value(
            values(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reply.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn cancelled_call_has_no_reply() {
        let token = CancellationToken::new();
        token.cancel();
        let source: ReplyStream = Box::pin(stream::pending());
        let reply = last_value(source, &token).await;
        assert_eq!(reply.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_inbound_ends_without_reply() {
        let reply = last_value(
            values(vec![Ok(json!(1)), Err(HandlerError::Cancelled)]),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reply.unwrap_err().code(), Code::Cancelled);
    }
}
