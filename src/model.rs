//! Core data model.
//!
//! A work item is one admitted capture waiting to be delivered. It carries
//! the artifact locator, lifecycle state, and delivery bookkeeping.

pub mod work;
