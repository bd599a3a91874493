use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref COMMANDS_ENQUEUED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_enqueued_total",
        "Total commands queued for devices"
    ))
    .unwrap();
    pub static ref COMMANDS_DELIVERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_delivered_total",
        "Total commands handed to polling devices"
    ))
    .unwrap();
    pub static ref COMMANDS_ACKNOWLEDGED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_acknowledged_total",
        "Total commands acknowledged by devices"
    ))
    .unwrap();
    pub static ref COMMANDS_EXPIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_commands_expired_total",
        "Total commands that expired before acknowledgement"
    ))
    .unwrap();
    pub static ref READINGS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_readings_accepted_total",
        "Total readings persisted"
    ))
    .unwrap();
    pub static ref BATCHES_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_batches_rejected_total",
        "Total reading batches rejected by validation"
    ))
    .unwrap();
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_publish_failures_total",
        "Total live feed events that could not be published"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "coordinator_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "coordinator_ingest_latency_seconds",
            "Time taken to persist a reading batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(COMMANDS_ENQUEUED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(COMMANDS_DELIVERED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(COMMANDS_ACKNOWLEDGED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(COMMANDS_EXPIRED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_ACCEPTED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(BATCHES_REJECTED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(DB_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
