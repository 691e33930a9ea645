//! Logging init for the quill binary: `RUST_LOG` wins, the configured level
//! is the fallback. Call once at startup.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level; overridden by the RUST_LOG env var.
    pub log_level: String,
    /// Compact single-line output instead of the full fmt layer.
    pub compact: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            compact: true,
        }
    }
}

static INIT: Once = Once::new();

/// Install the tracing subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init_telemetry(config: &TelemetryConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);
        if config.compact {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt.compact())
                .init();
        } else {
            tracing_subscriber::registry().with(filter).with(fmt).init();
        }
    });
}
