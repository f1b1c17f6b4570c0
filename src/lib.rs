//! Stratus — declarative cloud resource reconciliation.
//!
//! Desired-state graphs with typed attributes and cross-resource references,
//! diffed against recorded provider state into minimal plans, applied in
//! dependency order with partial-failure recovery and idempotent re-entry.

pub mod cli;
pub mod core;
pub mod provider;
pub mod trace;
