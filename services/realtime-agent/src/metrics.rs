//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade; this module
//! installs the exporter and adds the agent's own series:
//!
//! - `pipeline_requests_total` (counter): labels `method`, `outcome`
//! - `pipeline_refresh_total` (counter): label `outcome`
//! - `pipeline_refresh_queued_total` (counter)
//! - `realtime_connected` (gauge)
//! - `realtime_reconnects_scheduled_total` (counter)
//! - `realtime_frames_dropped_total` (counter): label `reason`
//! - `agent_notifications_total` (counter): label `kind`
//! - `agent_session_expired_total` (counter)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one notification delivered on the user queue.
pub fn record_notification(kind: &str) {
    metrics::counter!("agent_notifications_total", "kind" => kind.to_string()).increment(1);
}

/// Record a forced logout after a failed refresh.
pub fn record_session_expired() {
    metrics::counter!("agent_session_expired_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_notification("OFFER_RECEIVED");
        record_session_expired();
    }

    /// Isolated recorder/handle pair; only one global recorder may exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_notification_carries_kind_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_notification("OFFER_RECEIVED");
        record_notification("ORDER_SHIPPED");
        record_session_expired();

        let output = handle.render();
        assert!(output.contains("agent_notifications_total"));
        assert!(output.contains("kind=\"OFFER_RECEIVED\""));
        assert!(output.contains("kind=\"ORDER_SHIPPED\""));
        assert!(output.contains("agent_session_expired_total 1"));
    }

    #[test]
    fn library_series_render_through_the_same_recorder() {
        // The library crates only use the facade, so anything they record
        // must show up in the agent's /metrics output.
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let mut registry = realtime::SubscriptionRegistry::new();
        let (id, _) = registry.insert(
            "room-1",
            "/topic/chat/1",
            std::sync::Arc::new(|_: &realtime::Message| {}),
        );
        let frame = realtime::Frame::new(realtime::Command::Message)
            .header("subscription", &id)
            .body("{not json");
        assert!(registry.route(&frame).is_none());

        let output = handle.render();
        assert!(
            output.contains("realtime_frames_dropped_total{reason=\"body\"} 1"),
            "got: {output}"
        );
    }
}
