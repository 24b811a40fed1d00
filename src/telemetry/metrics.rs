//! Metric instrument factories for snapq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"snapq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for snapq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("snapq")
}

/// Counter: triggers received.
/// Labels: `result` ("admitted" | "debounced" | "stopped").
pub fn triggers() -> Counter<u64> {
    meter()
        .u64_counter("snapq.triggers")
        .with_description("Number of triggers received")
        .build()
}

/// Counter: capture attempts for admitted triggers.
/// Labels: `result` ("ok" | "error").
pub fn captures() -> Counter<u64> {
    meter()
        .u64_counter("snapq.captures")
        .with_description("Number of capture attempts")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("snapq.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Histogram: delivery call duration in milliseconds.
/// Labels: `result` ("ok" | "retryable" | "terminal").
pub fn delivery_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("snapq.delivery.duration_ms")
        .with_description("Delivery call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: items removed by the cleanup sweep.
/// Labels: `state`.
pub fn items_swept() -> Counter<u64> {
    meter()
        .u64_counter("snapq.cleanup.swept")
        .with_description("Work items removed by the cleanup sweep")
        .build()
}
