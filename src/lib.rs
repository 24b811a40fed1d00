//! # snapq
//!
//! Durable capture-and-deliver pipeline for on-demand screenshots.
//!
//! A trigger (hotkey, signal, stdin line) is debounced, captured to disk, and
//! persisted as a work item in SQLite. Delivery workers send each artifact to
//! a remote analysis endpoint under a shared rate limit, retrying transient
//! failures with capped exponential backoff. A periodic sweep removes settled
//! items and their artifacts. Items interrupted by a crash are recovered on
//! the next start.

pub mod collab;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod governor;
pub mod model;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
