//! Observability for the topic service.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit safe fields. Message
//! content, private data and public profiles never appear in log fields.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `topic_topics_active` | Gauge | none | Running topic actors |
//! | `topic_sessions_live` | Gauge | none | Registered sessions |
//! | `topic_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `topic_messages_published_total` | Counter | `category` | Accepted data messages |
//! | `topic_sessions_evicted_total` | Counter | `reason` | Forced session removals |
//! | `topic_presence_fanout_total` | Counter | `path` | Presence deliveries |
//! | `topic_storage_errors_total` | Counter | `operation` | Failed storage calls |
//! | `topic_actor_panics_total` | Counter | `actor_type` | Crashed actors |
//! | `topic_message_latency_seconds` | Histogram | `kind` | Mailbox item handling time |

pub mod metrics;

pub use metrics::init_metrics_recorder;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "topic_service=info";

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
    .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}
