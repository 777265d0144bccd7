//! # courier-grpc
//!
//! gRPC transport for courier.
//!
//! - [`server`]: [`GrpcServer`], serving every method of the configured
//!   packages over HTTP/2, with optional TLS
//! - [`loader`]: `.proto` compilation or a pre-built package definition
//! - [`discovery`]: the namespace tree and service lookup within a package
//! - [`routes`]: method → handler resolution and the request router
//! - [`call`]: the four method shapes (unary, server, client and bidi
//!   streaming)
//! - [`sink`]: the backpressured response writer
//! - [`subject`]: the replay buffer in front of inbound client streams
//! - [`codec`]: protobuf ↔ JSON through descriptors
//!
//! Handlers are registered under `{service, rpc, streaming}` patterns and
//! only see JSON values; descriptors are resolved at runtime, so no code is
//! generated from the `.proto` files.

#![deny(unsafe_code)]

pub mod call;
pub mod codec;
pub mod context;
pub mod discovery;
pub mod errors;
pub mod loader;
pub mod pattern;
pub mod routes;
pub mod server;
pub mod sink;
pub mod subject;

pub use call::{GrpcHandler, MethodRoute};
pub use codec::JsonCodec;
pub use context::{GrpcCall, GrpcContext, GrpcPayload};
pub use discovery::{Node, ServiceEntry};
pub use errors::{DefinitionError, error_from_status, status_from_error};
pub use loader::{PackageDefinition, ProtoSource};
pub use pattern::{GrpcStreaming, grpc_pattern};
pub use routes::{RouteTable, build_routes};
pub use server::{GrpcServer, GrpcServerBuilder};
pub use sink::{CallSink, DEFAULT_HIGH_WATER_MARK, ResponseSink, WriteOutcome, write_to_sink};
pub use subject::{BufferedSubject, InboundStream, buffered_subject};
