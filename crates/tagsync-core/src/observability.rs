//! Logging initialisation and span helpers.
//!
//! All components log through `tracing`. Spans carry the identity of the
//! object being worked on so that every event emitted while reconciling a
//! tag can be correlated without repeating fields on each line.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::TagRequest;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs.
    Json,
    /// Human-readable logs.
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(crate::error::Error::invalid_request(format!(
                "unknown log format {other:?}, expected `json` or `pretty`"
            ))),
        }
    }
}

/// Initializes the global subscriber.
///
/// Safe to call more than once; only the first call has an effect.
/// `RUST_LOG` controls levels and defaults to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Span for one reconcile of a request key.
#[must_use]
pub fn reconcile_span(controller: &str, request: &TagRequest) -> Span {
    tracing::info_span!(
        "reconcile",
        controller = controller,
        namespace = %request.namespace,
        name = %request.name,
    )
}

/// Span for work against a single follower cluster.
#[must_use]
pub fn cluster_span(operation: &str, cluster: &str) -> Span {
    tracing::debug_span!("cluster", op = operation, cluster = cluster)
}
