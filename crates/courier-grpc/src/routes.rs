//! Method route table and the HTTP/2 request router.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use courier_core::{Dispatcher, TransportError};
use prost_reflect::DescriptorPool;
use tokio_util::sync::CancellationToken;
use tonic::server::Grpc;
use tonic::Status;
use tracing::{debug, warn};

use crate::call::{MethodCall, MethodRoute};
use crate::codec::JsonCodec;
use crate::context::{GrpcContext, GrpcPayload};
use crate::discovery::Node;
use crate::pattern::{GrpcStreaming, grpc_pattern};

/// Per-entry overhead counted against the metadata limit, as in HTTP/2
/// header list sizing.
const HEADER_ENTRY_OVERHEAD: usize = 32;

/// Routed methods keyed by wire path.
pub type RouteTable = HashMap<String, Arc<MethodRoute>>;

/// Resolve a handler for every method of every service under `packages`.
///
/// Methods without a registered handler are left unrouted and answer
/// `UNIMPLEMENTED`.
pub fn build_routes(
    pool: &DescriptorPool,
    packages: &[String],
    dispatcher: &Dispatcher<GrpcPayload, GrpcContext>,
) -> Result<RouteTable, TransportError> {
    let root = Node::from_pool(pool);
    let mut routes = RouteTable::new();

    for package in packages {
        let node = root.lookup_package(package)?;
        for entry in node.collect_services() {
            for method in entry.service.methods() {
                let path = format!("/{}/{}", entry.service.full_name(), method.name());
                let qualified = entry.service.full_name();
                let resolved = GrpcStreaming::candidates(method.is_client_streaming())
                    .iter()
                    .find_map(|&streaming| {
                        [entry.name.as_str(), qualified].iter().find_map(|service| {
                            let route = grpc_pattern(service, method.name(), streaming).route();
                            dispatcher
                                .get_handler(&route)
                                .map(|registered| (streaming, registered.handler))
                        })
                    });
                let Some((streaming, handler)) = resolved else {
                    debug!(%path, "no handler for method");
                    continue;
                };
                debug!(%path, %streaming, "method routed");
                let _ = routes.insert(
                    path.clone(),
                    Arc::new(MethodRoute {
                        path,
                        method,
                        streaming,
                        handler,
                    }),
                );
            }
        }
    }
    Ok(routes)
}

/// Shared state of the request router.
pub(crate) struct CallRouter {
    pub(crate) routes: RouteTable,
    pub(crate) shutdown: CancellationToken,
    pub(crate) graceful: bool,
    pub(crate) high_water_mark: usize,
    pub(crate) max_receive_message_length: Option<usize>,
    pub(crate) max_send_message_length: Option<usize>,
    pub(crate) max_metadata_size: Option<u32>,
}

impl CallRouter {
    /// The axum router serving every routed method.
    pub(crate) fn into_router(self) -> Router {
        Router::new().fallback(handle_call).with_state(Arc::new(self))
    }

    /// Token for one call. Forced shutdown cancels every call; graceful
    /// shutdown lets them run to completion.
    fn call_token(&self) -> CancellationToken {
        if self.graceful {
            CancellationToken::new()
        } else {
            self.shutdown.child_token()
        }
    }
}

async fn handle_call(State(router): State<Arc<CallRouter>>, request: Request) -> Response {
    let path = request.uri().path().to_owned();

    if let Some(limit) = router.max_metadata_size {
        let size = metadata_size(request.headers());
        if size > limit as usize {
            warn!(%path, size, limit, "request metadata too large");
            return status_response(&Status::resource_exhausted(format!(
                "metadata size {size} exceeds limit {limit}"
            )));
        }
    }

    let Some(route) = router.routes.get(&path).cloned() else {
        debug!(%path, "unimplemented method");
        return status_response(&Status::unimplemented(format!("method {path} is not implemented")));
    };

    let method = route.method.clone();
    let call = MethodCall {
        route,
        token: router.call_token(),
        high_water_mark: router.high_water_mark,
    };
    let mut grpc = Grpc::new(JsonCodec::server(&method)).apply_max_message_size_config(
        router.max_receive_message_length,
        router.max_send_message_length,
    );

    let response = match (method.is_client_streaming(), method.is_server_streaming()) {
        (false, false) => grpc.unary(call, request).await,
        (false, true) => grpc.server_streaming(call, request).await,
        (true, false) => grpc.client_streaming(call, request).await,
        (true, true) => grpc.streaming(call, request).await,
    };
    response.map(Body::new)
}

/// Size of the request metadata as counted by HTTP/2.
fn metadata_size(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + HEADER_ENTRY_OVERHEAD)
        .sum()
}

/// Trailers-only response carrying `status`.
fn status_response(status: &Status) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    let _ = headers.insert("grpc-status", HeaderValue::from(status.code() as i32));
    if let Ok(message) = HeaderValue::from_str(status.message()) {
        let _ = headers.insert("grpc-message", message);
    }
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testing::hero_pool;
    use courier_core::{Reply, handler_fn};
    use tonic::Code;
    use tower::ServiceExt;

    fn echo() -> Arc<dyn courier_core::MessageHandler<GrpcPayload, GrpcContext>> {
        handler_fn(|payload: GrpcPayload, _ctx: GrpcContext| async move {
            Ok(Reply::Value(payload.into_message().unwrap_or_default()))
        })
    }

    fn router_with(routes: RouteTable, max_metadata_size: Option<u32>) -> Router {
        CallRouter {
            routes,
            shutdown: CancellationToken::new(),
            graceful: false,
            high_water_mark: 16,
            max_receive_message_length: None,
            max_send_message_length: None,
            max_metadata_size,
        }
        .into_router()
    }

    fn response_code(response: &Response) -> Option<Code> {
        response
            .headers()
            .get("grpc-status")?
            .to_str()
            .ok()?
            .parse::<i32>()
            .ok()
            .map(Code::from_i32)
    }

    fn grpc_request(path: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header(CONTENT_TYPE, "application/grpc")
            .body(Body::empty())
            .unwrap()
    }

    // ── route table ──

    #[test]
    fn short_service_name_routes() {
        let dispatcher = Dispatcher::new();
        let _ = dispatcher.add_handler(
            grpc_pattern("HeroService", "FindOne", GrpcStreaming::NoStream),
            echo(),
            false,
        );
        let routes = build_routes(&hero_pool(), &["hero".into()], &dispatcher).unwrap();

        let route = &routes["/hero.HeroService/FindOne"];
        assert_eq!(route.streaming, GrpcStreaming::NoStream);
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn qualified_service_name_is_the_fallback() {
        let dispatcher = Dispatcher::new();
        let _ = dispatcher.add_handler(
            grpc_pattern("hero.HeroService", "Countdown", GrpcStreaming::NoStream),
            echo(),
            false,
        );
        let routes = build_routes(&hero_pool(), &["hero".into()], &dispatcher).unwrap();
        assert!(routes.contains_key("/hero.HeroService/Countdown"));
    }

    #[test]
    fn request_streams_prefer_rx_over_pt() {
        let dispatcher = Dispatcher::new();
        let _ = dispatcher.add_handler(
            grpc_pattern("HeroService", "Sum", GrpcStreaming::PtStream),
            echo(),
            false,
        );
        let _ = dispatcher.add_handler(
            grpc_pattern("HeroService", "Sum", GrpcStreaming::RxStream),
            echo(),
            false,
        );
        let _ = dispatcher.add_handler(
            grpc_pattern("HeroService", "FindMany", GrpcStreaming::PtStream),
            echo(),
            false,
        );
        let routes = build_routes(&hero_pool(), &["hero".into()], &dispatcher).unwrap();

        assert_eq!(routes["/hero.HeroService/Sum"].streaming, GrpcStreaming::RxStream);
        assert_eq!(routes["/hero.HeroService/FindMany"].streaming, GrpcStreaming::PtStream);
    }

    #[test]
    fn unary_method_ignores_stream_patterns() {
        let dispatcher = Dispatcher::new();
        let _ = dispatcher.add_handler(
            grpc_pattern("HeroService", "FindOne", GrpcStreaming::RxStream),
            echo(),
            false,
        );
        let routes = build_routes(&hero_pool(), &["hero".into()], &dispatcher).unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn unknown_package_is_invalid() {
        let err = build_routes(&hero_pool(), &["villain".into()], &Dispatcher::new()).unwrap_err();
        assert!(matches!(err, TransportError::InvalidPackage { package } if package == "villain"));
    }

    // ── router ──

    #[tokio::test]
    async fn unknown_path_is_unimplemented() {
        let response = router_with(RouteTable::new(), None)
            .oneshot(grpc_request("/hero.HeroService/FindOne"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response_code(&response), Some(Code::Unimplemented));
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static("application/grpc")
        );
    }

    #[tokio::test]
    async fn oversized_metadata_is_rejected() {
        let request = {
            let mut request = grpc_request("/hero.HeroService/FindOne");
            let _ = request
                .headers_mut()
                .insert("x-blob", HeaderValue::from_str(&"a".repeat(512)).unwrap());
            request
        };
        let response = router_with(RouteTable::new(), Some(256))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response_code(&response), Some(Code::ResourceExhausted));
    }

    #[tokio::test]
    async fn metadata_within_limit_passes_through() {
        let response = router_with(RouteTable::new(), Some(4096))
            .oneshot(grpc_request("/hero.HeroService/FindOne"))
            .await
            .unwrap();
        assert_eq!(response_code(&response), Some(Code::Unimplemented));
    }

    #[test]
    fn metadata_size_counts_entry_overhead() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("ab", HeaderValue::from_static("xyz"));
        assert_eq!(metadata_size(&headers), 2 + 3 + HEADER_ENTRY_OVERHEAD);
    }

    #[test]
    fn forced_shutdown_cancels_call_tokens() {
        let shutdown = CancellationToken::new();
        let forced = CallRouter {
            routes: RouteTable::new(),
            shutdown: shutdown.clone(),
            graceful: false,
            high_water_mark: 16,
            max_receive_message_length: None,
            max_send_message_length: None,
            max_metadata_size: None,
        };
        let graceful = CallRouter {
            graceful: true,
            shutdown: shutdown.clone(),
            routes: RouteTable::new(),
            high_water_mark: 16,
            max_receive_message_length: None,
            max_send_message_length: None,
            max_metadata_size: None,
        };
        let forced_token = forced.call_token();
        let graceful_token = graceful.call_token();

        shutdown.cancel();
        assert!(forced_token.is_cancelled());
        assert!(!graceful_token.is_cancelled());
    }
}
