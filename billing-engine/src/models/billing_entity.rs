//! Billing entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Issuing company under which invoices are numbered and taxed.
///
/// `next_sequence` is the sequence the next allocation will hand out. It only
/// ever grows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEntity {
    pub entity_id: Uuid,
    pub name: String,
    pub invoice_prefix: String,
    pub tin: Option<String>,
    pub next_sequence: i64,
    pub created_utc: DateTime<Utc>,
}

/// Input for creating a billing entity.
#[derive(Debug, Clone)]
pub struct CreateBillingEntity {
    pub name: String,
    pub invoice_prefix: String,
    pub tin: Option<String>,
}

/// Sequence handed out by an atomic counter increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedSequence {
    pub prefix: String,
    pub sequence: i64,
}
