//! Metrics definitions for the CoCon client runtime.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cocon_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! The library only records through the `metrics` facade; installing an
//! exporter is left to the embedding application.
//!
//! # Cardinality
//!
//! Labels are bounded by enums in this crate:
//! - `status`: succeeded, failed, cancelled
//! - `outcome`: events, idle, failure, session_invalid, protocol
//! - `reason`: session_invalid, poll_failures, expired
//! - `kind`: error, panic, timeout

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a command reaching a terminal status.
///
/// Metric: `cocon_commands_total`
/// Labels: `status`
pub fn record_command(status: &'static str) {
    counter!("cocon_commands_total", "status" => status).increment(1);
}

/// Record a scheduled command retry.
///
/// Metric: `cocon_command_retries_total`
pub fn record_command_retry() {
    counter!("cocon_command_retries_total").increment(1);
}

/// Record time from `send` to terminal outcome.
///
/// Metric: `cocon_command_latency_seconds`
pub fn record_command_latency(duration: Duration) {
    histogram!("cocon_command_latency_seconds").record(duration.as_secs_f64());
}

/// Set the number of commands waiting in the queue.
///
/// Metric: `cocon_command_queue_depth`
pub fn set_queue_depth(depth: usize) {
    // usize to f64 conversion is safe for realistic queue depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("cocon_command_queue_depth").set(depth as f64);
}

/// Record the outcome of one long-poll request.
///
/// Metric: `cocon_poll_total`
/// Labels: `outcome`
pub fn record_poll(outcome: &'static str) {
    counter!("cocon_poll_total", "outcome" => outcome).increment(1);
}

/// Record a transition into Reconnecting.
///
/// Metric: `cocon_reconnects_total`
/// Labels: `reason`
pub fn record_reconnect(reason: &'static str) {
    counter!("cocon_reconnects_total", "reason" => reason).increment(1);
}

/// Record an event handed to the handler.
///
/// Metric: `cocon_events_dispatched_total`
pub fn record_event_dispatched() {
    counter!("cocon_events_dispatched_total").increment(1);
}

/// Record a failed handler invocation.
///
/// Metric: `cocon_handler_failures_total`
/// Labels: `kind`
pub fn record_handler_failure(kind: &'static str) {
    counter!("cocon_handler_failures_total", "kind" => kind).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_metrics_are_recorded_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_command("succeeded");
            record_command("succeeded");
            record_command("failed");
            record_command_retry();
            record_command_latency(Duration::from_millis(20));
            set_queue_depth(3);
            record_poll("idle");
            record_reconnect("session_invalid");
            record_event_dispatched();
            record_handler_failure("panic");
        });

        let metrics = snapshotter.snapshot().into_vec();
        assert!(metrics.len() >= 9, "got {} metrics", metrics.len());

        let succeeded = metrics
            .iter()
            .find(|(key, _, _, _)| {
                key.key().name() == "cocon_commands_total"
                    && key
                        .key()
                        .labels()
                        .any(|l| l.key() == "status" && l.value() == "succeeded")
            })
            .map(|(_, _, _, value)| value);
        assert_eq!(succeeded, Some(&DebugValue::Counter(2)));
    }
}
