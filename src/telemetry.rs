//! Logging Setup
//!
//! Structured logging for host binaries and long-running workers.
//! Library code only emits `tracing` events; hosts call
//! [`init_logging`] once at startup.

use tracing_subscriber::prelude::*;

/// Installs the global tracing subscriber: INFO by default,
/// overridable through `RUST_LOG`.
pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    // Avoid panics if already initialized (tests, embedded hosts).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
