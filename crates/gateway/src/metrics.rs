use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DECISION_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();
static DECISION_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static FILTER_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SETTINGS_RELOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tbac_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create tbac_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "tbac_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create tbac_gateway_http_request_duration_seconds"),
        )
    })
}

fn decisions_total() -> &'static IntCounterVec {
    DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tbac_gateway_decisions_total",
                    "Per-hit policy decisions by outcome.",
                ),
                &["outcome"],
            )
            .expect("create tbac_gateway_decisions_total"),
        )
    })
}

fn decision_duration_seconds() -> &'static Histogram {
    DECISION_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new(
                    "tbac_gateway_decision_duration_seconds",
                    "Latency of successful policy decisions in seconds.",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
            )
            .expect("create tbac_gateway_decision_duration_seconds"),
        )
    })
}

fn decision_errors_total() -> &'static IntCounterVec {
    DECISION_ERRORS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tbac_gateway_decision_errors_total",
                    "Failed policy decisions by error kind.",
                ),
                &["kind"],
            )
            .expect("create tbac_gateway_decision_errors_total"),
        )
    })
}

fn filter_outcomes_total() -> &'static IntCounterVec {
    FILTER_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tbac_gateway_filter_outcomes_total",
                    "Search responses by filter outcome.",
                ),
                &["outcome"],
            )
            .expect("create tbac_gateway_filter_outcomes_total"),
        )
    })
}

fn settings_reloads_total() -> &'static IntCounterVec {
    SETTINGS_RELOADS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "tbac_gateway_settings_reloads_total",
                    "Plugin settings reload attempts by outcome.",
                ),
                &["outcome"],
            )
            .expect("create tbac_gateway_settings_reloads_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_decision(outcome: &str, duration: Option<Duration>) {
    decisions_total().with_label_values(&[outcome]).inc();
    if let Some(duration) = duration {
        decision_duration_seconds().observe(duration.as_secs_f64());
    }
}

pub fn observe_decision_error(kind: &str) {
    decision_errors_total().with_label_values(&[kind]).inc();
}

pub fn observe_filter_outcome(outcome: &str) {
    filter_outcomes_total().with_label_values(&[outcome]).inc();
}

pub fn observe_settings_reload(outcome: &str) {
    settings_reloads_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = decisions_total();
    let _ = settings_reloads_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
