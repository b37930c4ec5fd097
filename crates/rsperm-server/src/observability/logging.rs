//! Log subscriber setup driven by the `logging` config section.
//!
//! Resolver log entries carry structured fields (`user_id`, `action`,
//! `resource`, `tag`, `reason`). With `logging.json` set, each entry is one
//! JSON object per line; otherwise a compact single-line text format is used.
//! `RUST_LOG`, when present, overrides `logging.level`.
//!
//! ```ignore
//! let config = ServerConfig::load("rsperm.yaml")?;
//! rsperm_server::observability::init_logging(&config.logging);
//! ```

use tracing::Subscriber;
use tracing_subscriber::{fmt, fmt::MakeWriter, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Installs the global subscriber. Returns false when one was already set.
pub fn init_logging(settings: &LoggingSettings) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(settings));
    tracing::subscriber::set_global_default(subscriber(filter, settings.json, std::io::stdout))
        .is_ok()
}

// Unknown levels fall back to info; `ServerConfig::validate` rejects them first.
fn level_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_new(settings.level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn subscriber<W>(filter: EnvFilter, json: bool, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (json_layer, text_layer) = if json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(writer);
        (Some(layer), None)
    } else {
        let layer = fmt::layer().compact().with_target(true).with_writer(writer);
        (None, Some(layer))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
}
