//! Error type for the billing engine.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Invalid transition: cannot {action} {entity} in status {from}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        action: &'static str,
    },

    #[error("A reason is required to {0}")]
    MissingReason(&'static str),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown billing entity: {0}")]
    UnknownBillingEntity(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A successful run already exists for the billing period. Resolved to a
    /// SKIPPED run by the executor, never surfaced to callers.
    #[error("Duplicate run for schedule {schedule_id} in period {period_key}")]
    DuplicateRun {
        schedule_id: Uuid,
        period_key: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(anyhow::Error),

    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InvalidAmount(_) => "invalid_amount",
            BillingError::InvalidRate(_) => "invalid_rate",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::MissingReason(_) => "missing_reason",
            BillingError::InvalidSchedule(_) => "invalid_schedule",
            BillingError::UnknownBillingEntity(_) => "unknown_billing_entity",
            BillingError::NotFound(_) => "not_found",
            BillingError::DuplicateRun { .. } => "duplicate_run",
            BillingError::Conflict(_) => "conflict",
            BillingError::PersistenceFailure(_) => "persistence",
            BillingError::DeliveryFailure(_) => "delivery",
            BillingError::Configuration(_) => "configuration",
        }
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        BillingError::PersistenceFailure(anyhow::anyhow!("{}: {}", context, err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidAmount(_)
            | BillingError::InvalidRate(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::MissingReason(_)
            | BillingError::InvalidSchedule(_)
            | BillingError::UnknownBillingEntity(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            BillingError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            BillingError::DuplicateRun { .. } | BillingError::Conflict(_) => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            BillingError::PersistenceFailure(e) => AppError::DatabaseError(e),
            BillingError::DeliveryFailure(msg) => AppError::BadGateway(msg),
            BillingError::Configuration(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
        }
    }
}
