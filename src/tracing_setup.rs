//! Structured logging.
//!
//! `RUST_LOG`, when set, wins over the configured level so a single run can be
//! turned up without editing config.

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;
use crate::error::Error;

/// Installs the global subscriber: JSON lines when `log.json`, pretty
/// console output otherwise.
///
/// Fails if the level directive does not parse or a global subscriber is
/// already installed.
pub fn init(log: &LogConfig) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .map_err(|e| Error::Logging(format!("invalid log level `{}`: {e}", log.level)))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let installed = if log.json {
        Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(true))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_file(true).with_line_number(true))
            .try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!(level = %log.level, json = log.json, "logging initialized");
    Ok(())
}
