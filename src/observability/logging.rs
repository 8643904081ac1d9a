//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (where `RUST_LOG` wins over the
//! configured level) plus a JSON or plain-text `fmt` layer.

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;

/// Filter directives for a configured level
pub fn default_directives(level: &str) -> String {
    format!("intent_gateway={},tower_http=info", level.to_lowercase())
}

/// Initialize the global subscriber; a second call is a logged no-op
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let result = if config.format.eq_ignore_ascii_case("json") {
        Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
}
