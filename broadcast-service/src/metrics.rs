use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, TextEncoder,
};

static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "broadcast_service_webhook_events_total",
            "Provider webhook events by type and reconcile outcome",
        ),
        &["event_type", "outcome"],
    )
    .expect("failed to create broadcast_service_webhook_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_webhook_events_total");
    counter
});

static RECONCILE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "broadcast_service_reconcile_duration_seconds",
            "Latency of one reconcile pass per webhook event",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ]),
        &["event_type"],
    )
    .expect("failed to create broadcast_service_reconcile_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register broadcast_service_reconcile_duration_seconds");
    histogram
});

static ORPHAN_RECORDINGS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "broadcast_service_orphan_recordings_total",
        "Recordings created with an unresolved creator",
    )
    .expect("failed to create broadcast_service_orphan_recordings_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_orphan_recordings_total");
    counter
});

static VIEWER_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "broadcast_service_viewer_events_total",
            "Viewer session joins, leaves, and reaped sessions",
        ),
        &["event"],
    )
    .expect("failed to create broadcast_service_viewer_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_viewer_events_total");
    counter
});

pub fn observe_webhook(event_type: &str, outcome: &str, elapsed: Duration) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event_type, outcome])
        .inc();
    RECONCILE_DURATION_SECONDS
        .with_label_values(&[event_type])
        .observe(elapsed.as_secs_f64());
}

pub fn record_webhook_outcome(event_type: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event_type, outcome])
        .inc();
}

pub fn record_orphan() {
    ORPHAN_RECORDINGS_TOTAL.inc();
}

pub fn record_viewer_event(event: &str) {
    VIEWER_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
