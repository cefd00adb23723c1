//! Metrics module for billing-engine.
//! Provides Prometheus metrics for billing runs, invoices and lifecycle transitions.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Sweep duration histogram, with buckets sized for a daily batch
pub static SWEEP_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "billing_sweep_duration_seconds",
        "Duration of one execute_due_runs sweep",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    ))
    .expect("Failed to register SWEEP_DURATION")
});

/// Billing run outcomes
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created, by source (scheduled, manual, adhoc) and initial status
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice lifecycle transitions
pub static INVOICE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Schedule lifecycle transitions
pub static SCHEDULE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_runs_total", "Total billing runs by outcome"),
            &["outcome"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoices_created_total",
                "Total invoices created by source and initial status"
            ),
            &["source", "status"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    INVOICE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_transitions_total",
                "Total invoice lifecycle transitions by action"
            ),
            &["action"]
        )
        .expect("Failed to register INVOICE_TRANSITIONS_TOTAL")
    });

    SCHEDULE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_schedule_transitions_total",
                "Total schedule lifecycle transitions by action"
            ),
            &["action"]
        )
        .expect("Failed to register SCHEDULE_TRANSITIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*SWEEP_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a billing run outcome.
pub fn record_billing_run(outcome: &str) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an invoice created.
pub fn record_invoice_created(source: &str, status: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[source, status]).inc();
    }
}

/// Record an invoice transition.
pub fn record_invoice_transition(action: &str) {
    if let Some(counter) = INVOICE_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

/// Record a schedule transition.
pub fn record_schedule_transition(action: &str) {
    if let Some(counter) = SCHEDULE_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
