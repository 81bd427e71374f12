//! Configuration Module
//!
//! Provides process-wide configuration loaded from TOML files with
//! environment-variable overrides, replacing hardcoded pipeline
//! thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `FLOWLENS_CONFIG` environment variable (path to TOML file)
//! 2. `flowlens.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(FlowLensConfig::load());
//!
//! // Anywhere in the codebase:
//! let width = config::get().resolution.window_seconds;
//! ```

pub mod defaults;
mod settings;

pub use settings::*;

use std::sync::OnceLock;

/// Global configuration, initialized once at startup.
static CONFIG: OnceLock<FlowLensConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: FlowLensConfig) {
    if CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if `init()` has not been called. A missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static FlowLensConfig {
    CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}
