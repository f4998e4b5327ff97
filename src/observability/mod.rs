//! Observability
//!
//! Structured audit events for privilege-relevant actions.

pub mod audit;
