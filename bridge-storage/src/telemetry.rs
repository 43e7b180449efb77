//! Tracing subscriber setup for processes embedding the bridge.
//!
//! The filter comes from `BRIDGE_LOG`, then `RUST_LOG`, then
//! [`DEFAULT_FILTER`]. Output is human-readable text or one JSON object per
//! line.

use std::str::FromStr;

use bridge_core::{BridgeError, BridgeResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `BRIDGE_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "bridge_storage=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "plain" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(BridgeError::failure(format!("unknown log format: {other}"))),
        }
    }
}

impl LogFormat {
    /// Format named by `BRIDGE_LOG_FORMAT`, defaulting to pretty.
    pub fn from_env() -> Self {
        std::env::var("BRIDGE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// Filter directives in effect for this process.
pub fn filter_directives() -> String {
    std::env::var("BRIDGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_tracing(format: LogFormat) -> BridgeResult<()> {
    let directives = filter_directives();
    let env_filter = EnvFilter::try_new(&directives)
        .map_err(|e| BridgeError::failure(format!("invalid log filter {directives:?}: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| BridgeError::failure(format!("Failed to init subscriber: {e}")))?;

    tracing::debug!(filter = %directives, format = ?format, "Tracing initialized");
    Ok(())
}
