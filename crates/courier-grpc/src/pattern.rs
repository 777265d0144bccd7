//! gRPC handler patterns: `{service, rpc, streaming}`.

use std::fmt;

use courier_core::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// How a handler consumes a method's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrpcStreaming {
    /// A single request message.
    NoStream,
    /// The request stream as a buffered sequence.
    RxStream,
    /// The raw call; the handler reads and writes it itself.
    PtStream,
}

impl GrpcStreaming {
    /// Wire name used inside patterns.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoStream => "no_stream",
            Self::RxStream => "rx_stream",
            Self::PtStream => "pt_stream",
        }
    }

    /// Candidates tried for a method, in priority order.
    pub fn candidates(client_streaming: bool) -> &'static [Self] {
        if client_streaming {
            &[Self::RxStream, Self::PtStream]
        } else {
            &[Self::NoStream]
        }
    }
}

impl fmt::Display for GrpcStreaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern for the handler of `service`/`rpc`.
pub fn grpc_pattern(service: &str, rpc: &str, streaming: GrpcStreaming) -> Pattern {
    Pattern::Structured(json!({
        "service": service,
        "rpc": rpc,
        "streaming": streaming.as_str(),
    }))
}
