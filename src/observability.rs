//! Observability surface
//!
//! Every counter, histogram, and gauge name in `spec.md` §6 is part of the
//! contract — label cardinality is bounded, never per-message. Stages
//! depend only on the [`ObservabilitySink`] trait; [`PrometheusTextSink`] is
//! the concrete exposition used at runtime (served over `axum` alongside
//! `/healthz` and `/readyz`), [`RecordingSink`] is an in-memory double for
//! tests, and [`NullSink`] discards everything (used by `--dry-run`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

/// A single run's metrics sink. Depended on by every stage via `&dyn
/// ObservabilitySink`. Methods are synchronous and lock briefly per update
/// (§5) so they can be called from both the serial stages and the
/// hierarchical worker pool without an `.await`.
pub trait ObservabilitySink: Send + Sync {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: u64);
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

impl dyn ObservabilitySink {
    /// Convenience for the common single-increment case.
    pub fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.inc_counter(name, labels, 1);
    }
}

/// Discards every report. Used for `--dry-run` and other paths where metric
/// collection would outlive the run's usefulness.
#[derive(Default)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn inc_counter(&self, _name: &str, _labels: &[(&str, &str)], _by: u64) {}
    fn observe_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    format!("{name}{{{}}}", parts.join(","))
}

/// In-memory sink recording every report verbatim, keyed by the rendered
/// `name{label=value,...}` series identity. Used by unit and integration
/// tests to assert on emitted metrics without standing up a server.
#[derive(Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters.lock().unwrap().get(&label_key(name, labels)).copied().unwrap_or(0)
    }

    pub fn histogram_values(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.histograms
            .lock()
            .unwrap()
            .get(&label_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.lock().unwrap().get(&label_key(name, labels)).copied()
    }
}

impl ObservabilitySink for RecordingSink {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = label_key(name, labels);
        *self.counters.lock().unwrap().entry(key).or_insert(0) += by;
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        self.histograms.lock().unwrap().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        self.gauges.lock().unwrap().insert(key, value);
    }
}

/// Prometheus text-exposition sink backed by atomics keyed under a small
/// `Mutex<HashMap<..>>` for labeled series — the teacher never imports
/// `parking_lot`, so this crate doesn't either (§5).
#[derive(Default)]
pub struct PrometheusTextSink {
    counters: Mutex<HashMap<String, AtomicU64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl PrometheusTextSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Render every recorded series as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.counters.lock().unwrap().iter() {
            out.push_str(&format!("{key} {}\n", value.load(Ordering::Relaxed)));
        }
        for (key, values) in self.histograms.lock().unwrap().iter() {
            let sum: f64 = values.iter().sum();
            out.push_str(&format!("{key}_sum {sum}\n{key}_count {}\n", values.len()));
        }
        for (key, value) in self.gauges.lock().unwrap().iter() {
            out.push_str(&format!("{key} {value}\n"));
        }
        out
    }
}

impl ObservabilitySink for PrometheusTextSink {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = label_key(name, labels);
        let counters = self.counters.lock().unwrap();
        match counters.get(&key) {
            Some(counter) => {
                counter.fetch_add(by, Ordering::Relaxed);
            }
            None => {
                drop(counters);
                self.counters
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(by, Ordering::Relaxed);
            }
        }
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        self.histograms.lock().unwrap().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        self.gauges.lock().unwrap().insert(key, value);
    }
}

/// Serves `/healthz` (liveness, always 200 once the process is up),
/// `/readyz` (readiness, 200 once the run has started accepting work), and
/// `/metrics` (Prometheus text exposition) on a background task alongside
/// the batch run. Mirrors the teacher's bound `axum::Router` + plain
/// `TcpListener::bind`/`axum::serve` pattern.
pub async fn serve_observability(
    sink: Arc<PrometheusTextSink>,
    ready: Arc<std::sync::atomic::AtomicBool>,
    bind_addr: &str,
) -> std::io::Result<()> {
    let state = ObservabilityState { sink, ready };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "observability endpoints listening");
    axum::serve(listener, app).await
}

#[derive(Clone)]
struct ObservabilityState {
    sink: Arc<PrometheusTextSink>,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ObservabilityState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ObservabilityState>) -> String {
    state.sink.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_accumulates_counters_by_label_set() {
        let sink = RecordingSink::new();
        sink.inc_counter("messages_fetched_total", &[("status", "ok")], 3);
        sink.inc_counter("messages_fetched_total", &[("status", "ok")], 2);
        sink.inc_counter("messages_fetched_total", &[("status", "error")], 1);
        assert_eq!(sink.counter("messages_fetched_total", &[("status", "ok")]), 5);
        assert_eq!(sink.counter("messages_fetched_total", &[("status", "error")]), 1);
    }

    #[test]
    fn recording_sink_tracks_histogram_observations() {
        let sink = RecordingSink::new();
        sink.observe_histogram("llm_latency_ms", &[], 120.0);
        sink.observe_histogram("llm_latency_ms", &[], 80.0);
        let values = sink.histogram_values("llm_latency_ms", &[]);
        assert_eq!(values, vec![120.0, 80.0]);
    }

    #[test]
    fn recording_sink_gauge_overwrites() {
        let sink = RecordingSink::new();
        sink.set_gauge("redundancy_index", &[], 0.3);
        sink.set_gauge("redundancy_index", &[], 0.4);
        assert_eq!(sink.gauge("redundancy_index", &[]), Some(0.4));
    }

    #[test]
    fn prometheus_sink_renders_accumulated_counter() {
        let sink = PrometheusTextSink::new();
        sink.inc_counter("runs_total", &[("status", "ok")], 1);
        sink.inc_counter("runs_total", &[("status", "ok")], 1);
        let rendered = sink.render();
        assert!(rendered.contains("runs_total{status=ok} 2"));
    }

    #[test]
    fn null_sink_discards_everything_without_panicking() {
        let sink = NullSink;
        sink.inc_counter("x", &[], 1);
        sink.observe_histogram("x", &[], 1.0);
        sink.set_gauge("x", &[], 1.0);
    }
}
