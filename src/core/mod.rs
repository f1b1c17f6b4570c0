//! Core engine — types, schemas, loading, planning, execution, state.

pub mod error;
pub mod executor;
pub mod graph;
pub mod loader;
pub mod planner;
pub mod schema;
pub mod state;
pub mod types;
