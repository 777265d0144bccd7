//! Definition-loading errors and the mapping between handler errors and
//! gRPC status codes.

use courier_core::errors::INTERNAL_SERVER_ERROR;
use courier_core::{HandlerError, TransportError};
use serde_json::{Value, json};
use tonic::{Code, Status};

/// Failures while loading or walking protobuf definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// A `.proto` file could not be read or compiled.
    #[error(transparent)]
    Compile(#[from] protox::Error),

    /// A pre-built descriptor set is malformed.
    #[error("invalid descriptor set: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// The configured package is not part of the loaded definitions.
    #[error("package \"{0}\" not found")]
    PackageNotFound(String),
}

/// Result type for definition loading.
pub type Result<T> = std::result::Result<T, DefinitionError>;

impl From<DefinitionError> for TransportError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::PackageNotFound(package) => Self::InvalidPackage { package },
            other => Self::ProtoLoad {
                message: other.to_string(),
            },
        }
    }
}

/// Status sent to the caller for a handler failure.
///
/// A structured `{code, message}` payload selects the status code; any
/// other payload is carried as the message of an `UNKNOWN` status.
pub fn status_from_error(err: &HandlerError) -> Status {
    match err {
        HandlerError::Rpc(payload) => rpc_status(payload),
        HandlerError::Internal { .. } => Status::internal(INTERNAL_SERVER_ERROR),
        HandlerError::Cancelled => Status::cancelled("call cancelled"),
    }
}

fn rpc_status(payload: &Value) -> Status {
    let code = payload
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok());
    match code {
        Some(code) => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Status::new(Code::from_i32(code), message)
        }
        None => match payload {
            Value::String(message) => Status::unknown(message.clone()),
            other => Status::unknown(other.to_string()),
        },
    }
}

/// Handler-facing error for a failed inbound stream.
pub fn error_from_status(status: &Status) -> HandlerError {
    if status.code() == Code::Cancelled {
        return HandlerError::Cancelled;
    }
    HandlerError::Rpc(json!({
        "code": status.code() as i32,
        "message": status.message(),
    }))
}
