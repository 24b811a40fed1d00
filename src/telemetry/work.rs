//! Delivery span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the delivery workers.

use tracing::Span;

use crate::model::work::{State, WorkId};

/// Start a span for one delivery attempt of a work item.
///
/// The `work.state` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_delivery_span(worker_id: usize, id: WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "delivery.attempt",
        "worker.id" = worker_id,
        "work.id" = %id,
        "work.attempt" = attempt,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("work.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
