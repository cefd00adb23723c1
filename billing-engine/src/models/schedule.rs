//! Billing schedule model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing schedule lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Pending,
    Active,
    Paused,
    Ended,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "PENDING",
            ScheduleStatus::Active => "ACTIVE",
            ScheduleStatus::Paused => "PAUSED",
            ScheduleStatus::Ended => "ENDED",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "ACTIVE" => ScheduleStatus::Active,
            "PAUSED" => ScheduleStatus::Paused,
            "ENDED" => ScheduleStatus::Ended,
            _ => ScheduleStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleStatus::Ended)
    }
}

/// How often a schedule bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingFrequency {
    Monthly,
    Quarterly,
    Annually,
    Custom,
}

impl BillingFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Monthly => "MONTHLY",
            BillingFrequency::Quarterly => "QUARTERLY",
            BillingFrequency::Annually => "ANNUALLY",
            BillingFrequency::Custom => "CUSTOM",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "QUARTERLY" => BillingFrequency::Quarterly,
            "ANNUALLY" => BillingFrequency::Annually,
            "CUSTOM" => BillingFrequency::Custom,
            _ => BillingFrequency::Monthly,
        }
    }
}

/// Unit of a custom billing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Days,
    Months,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Days => "DAYS",
            IntervalUnit::Months => "MONTHS",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "DAYS" => IntervalUnit::Days,
            _ => IntervalUnit::Months,
        }
    }
}

/// Whether an amount is subject to value-added tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VatPolicy {
    Vat,
    NonVat,
}

impl VatPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VatPolicy::Vat => "VAT",
            VatPolicy::NonVat => "NON_VAT",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "NON_VAT" => VatPolicy::NonVat,
            _ => VatPolicy::Vat,
        }
    }
}

/// Recurring billing instruction bound to one contract and one billing entity.
///
/// The customer fields are the identity snapshot copied onto every invoice the
/// schedule produces.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingSchedule {
    pub schedule_id: Uuid,
    pub contract_id: Uuid,
    pub billing_entity_id: Uuid,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_emails: Vec<String>,
    pub customer_tin: Option<String>,
    pub description: String,
    pub billing_amount: Decimal,
    pub amount_is_vat_inclusive: bool,
    pub vat_policy: String,
    pub has_withholding: bool,
    pub withholding_rate: Option<Decimal>,
    pub withholding_code: Option<String>,
    pub frequency: String,
    pub custom_interval_value: Option<i32>,
    pub custom_interval_unit: Option<String>,
    pub billing_day_of_month: i32,
    pub due_day_of_month: Option<i32>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub next_billing_date: Option<NaiveDate>,
    pub auto_approve: bool,
    pub auto_send_enabled: bool,
    pub status: String,
    pub run_count: i32,
    pub created_by: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl BillingSchedule {
    pub fn status(&self) -> ScheduleStatus {
        ScheduleStatus::from_string(&self.status)
    }

    pub fn frequency(&self) -> BillingFrequency {
        BillingFrequency::from_string(&self.frequency)
    }

    pub fn vat_policy(&self) -> VatPolicy {
        VatPolicy::from_string(&self.vat_policy)
    }

    pub fn custom_interval_unit(&self) -> Option<IntervalUnit> {
        self.custom_interval_unit
            .as_deref()
            .map(IntervalUnit::from_string)
    }
}

/// Input for creating a billing schedule. New schedules always start PENDING.
#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub contract_id: Uuid,
    pub billing_entity_id: Uuid,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_emails: Vec<String>,
    pub customer_tin: Option<String>,
    pub description: String,
    pub billing_amount: Decimal,
    pub amount_is_vat_inclusive: bool,
    pub vat_policy: VatPolicy,
    pub has_withholding: bool,
    pub withholding_rate: Option<Decimal>,
    pub withholding_code: Option<String>,
    pub frequency: BillingFrequency,
    pub custom_interval_value: Option<i32>,
    pub custom_interval_unit: Option<IntervalUnit>,
    pub billing_day_of_month: i32,
    pub due_day_of_month: Option<i32>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub auto_approve: bool,
    pub auto_send_enabled: bool,
    pub created_by: Option<Uuid>,
}

/// Lifecycle patch produced by a schedule transition. `None` leaves a column
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleUpdate {
    pub status: Option<ScheduleStatus>,
    pub next_billing_date: Option<NaiveDate>,
    pub approved_by: Option<Uuid>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl ScheduleUpdate {
    pub fn apply_to(&self, schedule: &mut BillingSchedule, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            schedule.status = status.as_str().to_string();
        }
        if let Some(next) = self.next_billing_date {
            schedule.next_billing_date = Some(next);
        }
        if let Some(actor) = self.approved_by {
            schedule.approved_by = Some(actor);
        }
        if let Some(at) = self.approved_utc {
            schedule.approved_utc = Some(at);
        }
        if let Some(reason) = &self.rejection_reason {
            schedule.rejection_reason = Some(reason.clone());
        }
        if let Some(at) = self.deleted_utc {
            schedule.deleted_utc = Some(at);
        }
        schedule.updated_utc = now;
    }
}

/// Result of billing (or skipping) one occurrence.
///
/// When `next_billing_date` is `None` the schedule has no remaining occurrence
/// and ends; its last `next_billing_date` is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleAdvance {
    pub next_billing_date: Option<NaiveDate>,
    pub increment_run_count: bool,
}
