//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("notefed_activities_received_total", "Total number of inbound activities by outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("notefed_activities_sent_total", "Total number of activities handed to delivery"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("notefed_delivery_attempts_total", "Total number of outbound delivery attempts"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_PENDING: IntGauge = IntGauge::new(
        "notefed_delivery_queue_pending",
        "Delivery jobs resumed from the persisted queue at startup"
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_ABANDONED: IntGauge = IntGauge::new(
        "notefed_delivery_queue_abandoned",
        "Abandoned delivery jobs kept in the persisted queue"
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "notefed_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("notefed_errors_total", "Total number of error responses"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; duplicate registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVITIES_RECEIVED.clone()),
        Box::new(ACTIVITIES_SENT.clone()),
        Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()),
        Box::new(DELIVERY_QUEUE_PENDING.clone()),
        Box::new(DELIVERY_QUEUE_ABANDONED.clone()),
        Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }
}
