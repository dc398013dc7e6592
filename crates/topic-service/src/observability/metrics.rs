//! Metrics definitions for the topic service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `topic_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `category`: 4 values (me, fnd, p2p, grp)
//! - `reason`: eviction reasons (expired, user, stuck, unsubscribed, banned)
//! - `path`: 2 values (online, offline)
//! - `operation`: bounded by storage calls (~20 values)
//! - `actor_type`: 2 values (hub, topic)
//! - `kind`: mailbox message kinds (~8 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle for serving
/// metrics.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Mailbox message handling, dominated by storage round trips
        .set_buckets_for_metric(
            Matcher::Prefix("topic_message_latency".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Topic & Session Metrics (Gauges)
// ============================================================================

/// Set the number of running topic actors.
///
/// Metric: `topic_topics_active`
/// Labels: none
pub fn set_topics_active(count: u64) {
    // u64 to f64 conversion is safe for realistic topic counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("topic_topics_active").set(count as f64);
}

/// Set the number of live sessions.
///
/// Metric: `topic_sessions_live`
/// Labels: none
pub fn set_sessions_live(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("topic_sessions_live").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `topic_actor_mailbox_depth`
/// Labels: `actor_type` (hub, topic)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("topic_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Event Counters
// ============================================================================

/// Record an accepted data message.
///
/// Metric: `topic_messages_published_total`
/// Labels: `category`
pub fn record_message_published(category: &str) {
    counter!("topic_messages_published_total", "category" => category.to_string()).increment(1);
}

/// Record a session forcibly removed from the registry or from a topic.
///
/// Metric: `topic_sessions_evicted_total`
/// Labels: `reason`
pub fn record_session_evicted(reason: &str) {
    counter!("topic_sessions_evicted_total", "reason" => reason.to_string()).increment(1);
}

/// Record one presence fan-out.
///
/// Metric: `topic_presence_fanout_total`
/// Labels: `path` (online, offline)
pub fn record_presence_fanout(path: &str) {
    counter!("topic_presence_fanout_total", "path" => path.to_string()).increment(1);
}

/// Record a failed storage call.
///
/// Metric: `topic_storage_errors_total`
/// Labels: `operation`
pub fn record_storage_error(operation: &str) {
    counter!("topic_storage_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record an actor panic.
///
/// Metric: `topic_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("topic_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record how long a topic took to handle one mailbox item.
///
/// Metric: `topic_message_latency_seconds`
/// Labels: `kind`
pub fn record_message_latency(kind: &str, duration: Duration) {
    histogram!("topic_message_latency_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder the macros record into a no-op sink,
    // so these only exercise the call paths.

    #[test]
    fn test_gauges() {
        set_topics_active(0);
        set_topics_active(1_000);
        set_sessions_live(42);
        set_actor_mailbox_depth("topic", 300);
        set_actor_mailbox_depth("hub", 0);
    }

    #[test]
    fn test_counters() {
        for category in ["me", "fnd", "p2p", "grp"] {
            record_message_published(category);
        }
        for reason in ["expired", "user", "stuck", "unsubscribed", "banned"] {
            record_session_evicted(reason);
        }
        record_presence_fanout("online");
        record_presence_fanout("offline");
        record_storage_error("message_save");
        record_actor_panic("topic");
    }

    #[test]
    fn test_histograms() {
        record_message_latency("join", Duration::from_millis(3));
        record_message_latency("broadcast", Duration::from_micros(250));
    }

    #[test]
    fn test_recorded_values_with_local_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_topics_active(3);
            record_message_published("grp");
            record_message_published("grp");
            record_presence_fanout("offline");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert!(!snapshot.is_empty());

        let published = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "topic_messages_published_total")
            .map(|(_, _, _, value)| value.clone())
            .unwrap();
        assert_eq!(*published, DebugValue::Counter(2));

        let topics = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "topic_topics_active")
            .map(|(_, _, _, value)| value.clone())
            .unwrap();
        assert!(matches!(topics, DebugValue::Gauge(v) if v.into_inner() == 3.0));
    }
}
