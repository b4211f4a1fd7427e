//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use switchboard_core::events::SessionEvent;
use switchboard_core::session::HandoffKind;
use switchboard_pool::PoolMetrics;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Record a session opening.
pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
}

/// Record a session closing.
pub fn record_session_close() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// Count the turn-level events flowing through a connection.
pub fn record_event(event: &SessionEvent) {
    match event {
        SessionEvent::UtteranceTranscribed { is_final: true, .. } => {
            metrics::counter!("turns_total").increment(1);
        }
        SessionEvent::AgentSwitched { kind, .. } => {
            let kind = match kind {
                HandoffKind::Announced => "announced",
                HandoffKind::Discrete => "discrete",
            };
            let labels = [("kind", kind.to_string())];
            metrics::counter!("handoffs_total", &labels).increment(1);
        }
        SessionEvent::BargeIn => {
            metrics::counter!("barge_ins_total").increment(1);
        }
        SessionEvent::ToolInvoked { name, error, .. } => {
            let labels = [
                ("tool", name.clone()),
                ("outcome", if error.is_some() { "error" } else { "ok" }.to_string()),
            ];
            metrics::counter!("tool_invocations_total", &labels).increment(1);
        }
        _ => {}
    }
}

/// Publish one pool's levels, sampled at scrape time.
pub fn record_pool_levels(kind: &str, snapshot: &PoolMetrics) {
    let labels = [("pool", kind.to_string())];
    metrics::gauge!("pool_warm_level", &labels).set(snapshot.warm_level as f64);
    metrics::gauge!("pool_dedicated_count", &labels).set(snapshot.dedicated_count as f64);
    metrics::counter!("pool_warm_hits_total", &labels).absolute(snapshot.warm_hits);
    metrics::counter!("pool_dedicated_hits_total", &labels).absolute(snapshot.dedicated_hits);
    metrics::counter!("pool_cold_creates_total", &labels).absolute(snapshot.cold_creates);
}
