//! # courier-settings
//!
//! Configuration for the courier transports, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`CourierSettings::default()`]
//! 2. **Settings file**: `~/.courier/settings.json`, or the path in
//!    `COURIER_SETTINGS_PATH` (deep-merged over defaults)
//! 3. **Environment variables**: `COURIER_*` overrides (highest priority)
//!
//! Field names in the file are camelCase and match the option names
//! recognized by each transport (`retryAttempts`, `prefetchCount`,
//! `maxReceiveMessageLength`, ...).

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod tls;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
