//! # courier-logging
//!
//! Structured logging for courier transports, built on `tracing`.
//!
//! - [`init_subscriber`] installs the process-wide subscriber (stderr,
//!   compact or JSON lines, filtered by `RUST_LOG` or a fallback level)
//! - [`capture_logs`] installs a thread-local capturing subscriber for
//!   tests that assert on warnings and errors emitted by a transport

#![deny(unsafe_code)]

pub mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Initialize the global tracing subscriber with stderr output.
///
/// Call once at startup; later calls are no-ops. `RUST_LOG` takes priority
/// over `level` when set.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init is a no-op if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
