//! Prometheus metrics for the billing engine.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec,
    TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
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

/// Billing pass counter
pub static BILLING_PASSES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created counter
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount counter (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Invoices that went overdue
pub static INVOICES_OVERDUE_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Payment initiation counter by outcome
pub static PAYMENT_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Access provisioning counter
pub static ACCESS_CHANGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscriptions deactivated counter
pub static SUBSCRIPTIONS_DEACTIVATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_PASSES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_passes_total",
                "Total billing passes by trigger and status"
            ),
            &["kind", "status"]
        )
        .expect("Failed to register BILLING_PASSES_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_invoices_created_total", "Total invoices created"),
            &["kind"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_invoice_amount_total",
                "Total amount invoiced by invoice kind"
            ),
            &["kind"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    INVOICES_OVERDUE_TOTAL.get_or_init(|| {
        register_int_counter!(
            "billing_invoices_overdue_total",
            "Invoices transitioned to overdue by the sweep"
        )
        .expect("Failed to register INVOICES_OVERDUE_TOTAL")
    });

    PAYMENT_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payment_requests_total",
                "Payment initiations by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register PAYMENT_REQUESTS_TOTAL")
    });

    ACCESS_CHANGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_access_changes_total",
                "Access provisioning requests by action and connection type"
            ),
            &["action", "connection_type"]
        )
        .expect("Failed to register ACCESS_CHANGES_TOTAL")
    });

    SUBSCRIPTIONS_DEACTIVATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscriptions_deactivated_total",
                "Subscriptions deactivated by reason"
            ),
            &["reason"]
        )
        .expect("Failed to register SUBSCRIPTIONS_DEACTIVATED_TOTAL")
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
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a completed billing pass.
pub fn record_billing_pass(kind: &str, status: &str) {
    if let Some(counter) = BILLING_PASSES_TOTAL.get() {
        counter.with_label_values(&[kind, status]).inc();
    }
}

/// Record a created invoice and its amount.
pub fn record_invoice_created(kind: &str, amount: Decimal) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[kind])
            .inc_by(amount.to_f64().unwrap_or(0.0).abs());
    }
}

/// Record an invoice transitioned to overdue.
pub fn record_invoice_overdue() {
    if let Some(counter) = INVOICES_OVERDUE_TOTAL.get() {
        counter.inc();
    }
}

/// Record a payment initiation outcome.
pub fn record_payment_request(outcome: &str) {
    if let Some(counter) = PAYMENT_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an access provisioning request.
pub fn record_access_change(action: &str, connection_type: &str) {
    if let Some(counter) = ACCESS_CHANGES_TOTAL.get() {
        counter.with_label_values(&[action, connection_type]).inc();
    }
}

/// Record a deactivated subscription.
pub fn record_subscription_deactivated(reason: &str) {
    if let Some(counter) = SUBSCRIPTIONS_DEACTIVATED_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
