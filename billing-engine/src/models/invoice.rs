//! Invoice model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::schedule::{BillingFrequency, VatPolicy};

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Approved,
    Rejected,
    Sent,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Approved => "APPROVED",
            InvoiceStatus::Rejected => "REJECTED",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Void => "VOID",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "APPROVED" => InvoiceStatus::Approved,
            "REJECTED" => InvoiceStatus::Rejected,
            "SENT" => InvoiceStatus::Sent,
            "PAID" => InvoiceStatus::Paid,
            "VOID" => InvoiceStatus::Void,
            _ => InvoiceStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Rejected | InvoiceStatus::Paid | InvoiceStatus::Void
        )
    }
}

/// Email delivery state of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    NotSent,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::NotSent => "NOT_SENT",
            EmailStatus::Sent => "SENT",
            EmailStatus::Failed => "FAILED",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "SENT" => EmailStatus::Sent,
            "FAILED" => EmailStatus::Failed,
            _ => EmailStatus::NotSent,
        }
    }
}

/// Billable document derived from a schedule or an ad-hoc request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub billing_entity_id: Uuid,
    pub billing_number: String,
    pub schedule_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_emails: Vec<String>,
    pub customer_tin: Option<String>,
    pub statement_date: NaiveDate,
    pub due_date: NaiveDate,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub billing_frequency: Option<String>,
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub gross_amount: Decimal,
    pub withholding_tax: Decimal,
    pub net_amount: Decimal,
    pub vat_policy: String,
    pub has_withholding: bool,
    pub withholding_rate: Option<Decimal>,
    pub withholding_code: Option<String>,
    pub status: String,
    pub approved_by: Option<Uuid>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub rejected_by: Option<Uuid>,
    pub rejected_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub reschedule_date: Option<NaiveDate>,
    pub voided_by: Option<Uuid>,
    pub voided_utc: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub email_status: String,
    pub sent_utc: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_error: Option<String>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub paid_amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_reference: Option<String>,
    pub follow_up_enabled: bool,
    pub follow_up_count: i32,
    pub follow_up_level: i32,
    pub last_follow_up_utc: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn email_status(&self) -> EmailStatus {
        EmailStatus::from_string(&self.email_status)
    }

    pub fn vat_policy(&self) -> VatPolicy {
        VatPolicy::from_string(&self.vat_policy)
    }

    pub fn billing_frequency(&self) -> Option<BillingFrequency> {
        self.billing_frequency
            .as_deref()
            .map(BillingFrequency::from_string)
    }
}

/// Input for inserting an invoice. The billing number is assigned by the
/// store inside the same unit of work as the insert.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub billing_entity_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_emails: Vec<String>,
    pub customer_tin: Option<String>,
    pub statement_date: NaiveDate,
    pub due_date: NaiveDate,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub billing_frequency: Option<BillingFrequency>,
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub gross_amount: Decimal,
    pub withholding_tax: Decimal,
    pub net_amount: Decimal,
    pub vat_policy: VatPolicy,
    pub has_withholding: bool,
    pub withholding_rate: Option<Decimal>,
    pub withholding_code: Option<String>,
    pub status: InvoiceStatus,
    pub approved_utc: Option<DateTime<Utc>>,
    pub follow_up_enabled: bool,
    pub created_by: Option<Uuid>,
}

/// Lifecycle patch produced by an invoice transition. `None` leaves a column
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceUpdate {
    pub status: Option<InvoiceStatus>,
    pub approved_by: Option<Uuid>,
    pub approved_utc: Option<DateTime<Utc>>,
    pub rejected_by: Option<Uuid>,
    pub rejected_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub reschedule_date: Option<NaiveDate>,
    pub voided_by: Option<Uuid>,
    pub voided_utc: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub email_status: Option<EmailStatus>,
    pub sent_utc: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_error: Option<String>,
    /// Clears a previously recorded delivery error.
    pub clear_email_error: bool,
    pub paid_utc: Option<DateTime<Utc>>,
    pub paid_amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_reference: Option<String>,
    pub follow_up_count: Option<i32>,
    pub follow_up_level: Option<i32>,
    pub last_follow_up_utc: Option<DateTime<Utc>>,
}

impl InvoiceUpdate {
    pub fn apply_to(&self, invoice: &mut Invoice, now: DateTime<Utc>) {
        fn set<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }

        if let Some(status) = self.status {
            invoice.status = status.as_str().to_string();
        }
        if let Some(email_status) = self.email_status {
            invoice.email_status = email_status.as_str().to_string();
        }
        set(&mut invoice.approved_by, &self.approved_by);
        set(&mut invoice.approved_utc, &self.approved_utc);
        set(&mut invoice.rejected_by, &self.rejected_by);
        set(&mut invoice.rejected_utc, &self.rejected_utc);
        set(&mut invoice.rejection_reason, &self.rejection_reason);
        set(&mut invoice.reschedule_date, &self.reschedule_date);
        set(&mut invoice.voided_by, &self.voided_by);
        set(&mut invoice.voided_utc, &self.voided_utc);
        set(&mut invoice.void_reason, &self.void_reason);
        set(&mut invoice.sent_utc, &self.sent_utc);
        set(&mut invoice.email_message_id, &self.email_message_id);
        set(&mut invoice.email_error, &self.email_error);
        if self.clear_email_error {
            invoice.email_error = None;
        }
        set(&mut invoice.paid_utc, &self.paid_utc);
        set(&mut invoice.paid_amount, &self.paid_amount);
        set(&mut invoice.payment_method, &self.payment_method);
        set(&mut invoice.payment_reference, &self.payment_reference);
        set(&mut invoice.last_follow_up_utc, &self.last_follow_up_utc);
        if let Some(count) = self.follow_up_count {
            invoice.follow_up_count = count;
        }
        if let Some(level) = self.follow_up_level {
            invoice.follow_up_level = level;
        }
        invoice.updated_utc = now;
    }
}

/// Outcome reported by the email collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Payment details recorded when an invoice is marked paid.
#[derive(Debug, Clone)]
pub struct PaymentDetails {
    pub amount: Decimal,
    pub method: String,
    pub reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}
