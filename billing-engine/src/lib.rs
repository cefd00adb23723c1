//! billing-engine: recurring billing and tax computation.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

pub use error::BillingError;
pub use startup::AppState;
