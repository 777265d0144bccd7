//! gRPC transport options.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use super::TlsFiles;

/// Options recognized by the gRPC transport server.
///
/// `protoPath` is the file-based source of service definitions. A
/// pre-built descriptor pool can be supplied to the server instead; the two
/// are mutually exclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcOptions {
    /// Bind address (`host:port`).
    pub url: String,
    /// `.proto` files to load. A single string is accepted too.
    #[serde(
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub proto_path: Vec<PathBuf>,
    /// Package(s) whose services are exposed. A single string is accepted too.
    #[serde(deserialize_with = "one_or_many")]
    pub package: Vec<String>,
    /// Proto loader options.
    pub loader: LoaderOptions,
    /// HTTP/2 channel tuning.
    pub channel_options: ChannelOptions,
    /// Largest outbound message, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_send_message_length: Option<usize>,
    /// Largest inbound message, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_receive_message_length: Option<usize>,
    /// Largest request metadata (header list), in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_metadata_size: Option<u32>,
    /// Let in-flight calls finish on close.
    pub graceful_shutdown: bool,
    /// Serve TLS with this certificate and key; insecure when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<TlsFiles>,
}

impl Default for GrpcOptions {
    fn default() -> Self {
        Self {
            url: "localhost:5000".to_string(),
            proto_path: Vec::new(),
            package: Vec::new(),
            loader: LoaderOptions::default(),
            channel_options: ChannelOptions::default(),
            max_send_message_length: None,
            max_receive_message_length: None,
            max_metadata_size: None,
            graceful_shutdown: false,
            credentials: None,
        }
    }
}

/// Proto loader options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderOptions {
    /// Import search paths. The directory of each proto file is always
    /// searched.
    pub include_dirs: Vec<PathBuf>,
}

/// HTTP/2 settings applied to every accepted connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelOptions {
    /// Concurrent streams per connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_streams: Option<u32>,
    /// Initial per-stream flow-control window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_stream_window_size: Option<u32>,
    /// Largest HTTP/2 frame payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u32>,
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}
