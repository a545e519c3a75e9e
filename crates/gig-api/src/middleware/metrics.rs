//! # Prometheus Metrics
//!
//! HTTP request metrics are recorded by [`metrics_middleware`]. Transition
//! and settlement counters are pushed by the marketplace as operations run.
//! Entity gauges (jobs and milestones by status, open disputes, stalled
//! settlements, live workspace sessions) are refreshed on each `/metrics`
//! scrape.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Shared metrics state backed by a Prometheus registry.
#[derive(Clone)]
pub struct ApiMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,

    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_errors_total: IntCounterVec,

    transitions_total: IntCounterVec,
    settlement_outcomes_total: IntCounterVec,

    jobs_total: GaugeVec,
    milestones_total: GaugeVec,
    open_disputes: Gauge,
    stalled_settlements: Gauge,
    workspace_sessions: Gauge,
}

impl std::fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMetrics")
            .field("requests", &self.requests())
            .field("errors", &self.errors())
            .finish()
    }
}

impl ApiMetrics {
    /// Fresh registry with every metric registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("gig_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gig_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "path"],
        )?;
        let http_errors_total = IntCounterVec::new(
            Opts::new("gig_http_errors_total", "Total HTTP errors (4xx and 5xx)"),
            &["method", "path", "status"],
        )?;
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "gig_transitions_total",
                "Lifecycle transitions attempted, by entity, action and outcome code",
            ),
            &["entity", "action", "outcome"],
        )?;
        let settlement_outcomes_total = IntCounterVec::new(
            Opts::new("gig_settlement_outcomes_total", "Settlement batch outcomes"),
            &["outcome"],
        )?;
        let jobs_total = GaugeVec::new(Opts::new("gig_jobs_total", "Jobs by status"), &["status"])?;
        let milestones_total = GaugeVec::new(
            Opts::new("gig_milestones_total", "Milestones by status"),
            &["status"],
        )?;
        let open_disputes = Gauge::new("gig_open_disputes", "Disputes awaiting a ruling")?;
        let stalled_settlements = Gauge::new(
            "gig_stalled_settlements",
            "Milestones whose settlement needs an operator",
        )?;
        let workspace_sessions = Gauge::new("gig_workspace_sessions", "Tracked workspace sessions")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_errors_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(settlement_outcomes_total.clone()))?;
        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(milestones_total.clone()))?;
        registry.register(Box::new(open_disputes.clone()))?;
        registry.register(Box::new(stalled_settlements.clone()))?;
        registry.register(Box::new(workspace_sessions.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                http_requests_total,
                http_request_duration_seconds,
                http_errors_total,
                transitions_total,
                settlement_outcomes_total,
                jobs_total,
                milestones_total,
                open_disputes,
                stalled_settlements,
                workspace_sessions,
            }),
        })
    }

    /// Total request count across all labels.
    pub fn requests(&self) -> u64 {
        sum_counter(&self.inner.http_requests_total)
    }

    /// Total error count across all labels.
    pub fn errors(&self) -> u64 {
        sum_counter(&self.inner.http_errors_total)
    }

    fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.inner
            .http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.inner
            .http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
        if status >= 400 {
            self.inner
                .http_errors_total
                .with_label_values(&[method, path, &status_str])
                .inc();
        }
    }

    /// Count one transition attempt. `outcome` is `ok` or a rejection code.
    pub fn record_transition(&self, entity: &str, action: &str, outcome: &str) {
        self.inner
            .transitions_total
            .with_label_values(&[entity, action, outcome])
            .inc();
    }

    /// Transitions recorded for `(entity, action, outcome)`.
    pub fn transitions(&self, entity: &str, action: &str, outcome: &str) -> u64 {
        self.inner
            .transitions_total
            .with_label_values(&[entity, action, outcome])
            .get()
    }

    /// Count one settlement batch outcome.
    pub fn record_settlement(&self, outcome: &str) {
        self.inner
            .settlement_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Settlement outcomes recorded under `outcome`.
    pub fn settlements(&self, outcome: &str) -> u64 {
        self.inner
            .settlement_outcomes_total
            .with_label_values(&[outcome])
            .get()
    }

    pub fn jobs_total(&self) -> &GaugeVec {
        &self.inner.jobs_total
    }

    pub fn milestones_total(&self) -> &GaugeVec {
        &self.inner.milestones_total
    }

    pub fn open_disputes(&self) -> &Gauge {
        &self.inner.open_disputes
    }

    pub fn stalled_settlements(&self) -> &Gauge {
        &self.inner.stalled_settlements
    }

    pub fn workspace_sessions(&self) -> &Gauge {
        &self.inner.workspace_sessions
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather_and_encode(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("failed to encode metrics: {e}"))?;
        String::from_utf8(buffer).map_err(|e| format!("metrics encoding produced invalid UTF-8: {e}"))
    }
}

fn sum_counter(counter: &IntCounterVec) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|mf| mf.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

/// Replace UUID segments with `{id}` to bound label cardinality.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let hyphenated = segment.len() == 36
                && segment.chars().enumerate().all(|(i, c)| {
                    if matches!(i, 8 | 13 | 18 | 23) {
                        c == '-'
                    } else {
                        c.is_ascii_hexdigit()
                    }
                });
            let simple = segment.len() == 32 && segment.chars().all(|c| c.is_ascii_hexdigit());
            if hyphenated || simple {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record method, normalized path, status and latency of every request.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());
    let start = Instant::now();

    let response = next.run(request).await;

    if let Some(m) = metrics {
        m.record_request(&method, &path, response.status().as_u16(), start.elapsed().as_secs_f64());
    }
    response
}
