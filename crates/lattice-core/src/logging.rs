//! Tracing subscriber setup.

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

use crate::config::LoggingConfig;

fn filter_for(config: &LoggingConfig) -> EnvFilter {
    match std::env::var("RUST_LOG").as_deref() {
        Ok("debug") => EnvFilter::new("warn,lattice_core=debug,tests=debug"),
        Ok("trace") => EnvFilter::new("warn,lattice_core=trace,tests=trace"),
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,lattice_core={}", config.level))),
        Err(_) => EnvFilter::new(format!("warn,lattice_core={}", config.level)),
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Any format other than `"json"` is
/// rendered pretty.
///
/// # Errors
///
/// Returns [`TryInitError`] if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(filter_for(config));

    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).try_init()
    }
}
