use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    dispatches: CounterVec,
    dispatch_seconds: HistogramVec,
    jobs_submitted: CounterVec,
    result_frames: CounterVec,
    result_bytes: CounterVec,
    job_terminal: CounterVec,
    active_sinks: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Count one dispatch attempt by op kind and outcome (`submitted`, `unsupported`,
    /// `metadata`, ...).
    pub fn record_dispatch(&self, op: &str, outcome: &str, secs: f64) {
        self.inner
            .dispatches
            .with_label_values(&[op, outcome])
            .inc();
        self.inner
            .dispatch_seconds
            .with_label_values(&[op])
            .observe(secs.max(0.0));
    }

    pub fn inc_jobs_submitted(&self, partitions: u64) {
        self.inner
            .jobs_submitted
            .with_label_values(&[&partitions.to_string()])
            .inc();
    }

    /// Count one result frame. `decode` is `ok` or `rejected`.
    pub fn record_result_frame(&self, decode: &str, bytes: u64) {
        self.inner.result_frames.with_label_values(&[decode]).inc();
        self.inner
            .result_bytes
            .with_label_values(&[decode])
            .inc_by(bytes as f64);
    }

    /// Count a job reaching a terminal state (`completed`, `failed`, `cancelled`).
    pub fn inc_job_terminal(&self, state: &str) {
        self.inner.job_terminal.with_label_values(&[state]).inc();
    }

    pub fn set_active_sinks(&self, active: u64) {
        self.inner
            .active_sinks
            .with_label_values(&["broadcaster"])
            .set(active as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let dispatches = counter_vec(
            &registry,
            "gqd_dispatch_total",
            "Dispatched operations by op kind and outcome",
            &["op", "outcome"],
        );
        let dispatch_seconds = histogram_vec(
            &registry,
            "gqd_dispatch_seconds",
            "Time from request intake to job submission",
            &["op"],
        );
        let jobs_submitted = counter_vec(
            &registry,
            "gqd_jobs_submitted_total",
            "Jobs accepted by the cluster broadcaster",
            &["partitions"],
        );
        let result_frames = counter_vec(
            &registry,
            "gqd_result_frames_total",
            "Result frames delivered to sinks",
            &["decode"],
        );
        let result_bytes = counter_vec(
            &registry,
            "gqd_result_bytes_total",
            "Result frame bytes delivered to sinks",
            &["decode"],
        );
        let job_terminal = counter_vec(
            &registry,
            "gqd_job_terminal_total",
            "Jobs reaching a terminal state",
            &["state"],
        );
        let active_sinks = gauge_vec(
            &registry,
            "gqd_active_sinks",
            "Result sinks currently registered",
            &["component"],
        );

        Self {
            registry,
            dispatches,
            dispatch_seconds,
            jobs_submitted,
            result_frames,
            result_bytes,
            job_terminal,
            active_sinks,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
