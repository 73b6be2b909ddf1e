//! Observability
//!
//! Structured coordination events and per-process counters.

pub mod events;
pub mod metrics;
