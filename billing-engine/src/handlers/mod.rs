//! HTTP handlers for billing-engine.

pub mod health;
pub mod runs;

pub use health::{health_check, metrics_handler, readiness_check};
pub use runs::{list_schedule_runs, run_schedule_now, trigger_sweep};
