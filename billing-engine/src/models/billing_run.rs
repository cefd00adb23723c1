//! Billing run model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What started a billing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunType {
    Scheduled,
    Manual,
}

impl BillingRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunType::Scheduled => "scheduled",
            BillingRunType::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => BillingRunType::Manual,
            _ => BillingRunType::Scheduled,
        }
    }
}

/// Outcome of a billing run. Only `Pending` runs may be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Pending => "PENDING",
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Failed => "FAILED",
            RunOutcome::Skipped => "SKIPPED",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "SUCCESS" => RunOutcome::Success,
            "FAILED" => RunOutcome::Failed,
            "SKIPPED" => RunOutcome::Skipped,
            _ => RunOutcome::Pending,
        }
    }
}

/// One execution attempt of a schedule for one occurrence date.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingRun {
    pub run_id: Uuid,
    pub schedule_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub run_date: NaiveDate,
    pub period_key: String,
    pub run_type: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl BillingRun {
    pub fn outcome(&self) -> RunOutcome {
        RunOutcome::from_string(&self.status)
    }
}

/// Input for opening a billing run.
#[derive(Debug, Clone)]
pub struct BeginRun {
    pub schedule_id: Uuid,
    pub run_date: NaiveDate,
    pub period_key: String,
    pub run_type: BillingRunType,
}
