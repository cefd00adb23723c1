//! Invoice state machine.
//!
//! ```text
//! PENDING ──approve──▶ APPROVED ──mark_sent──▶ SENT ──mark_paid──▶ PAID
//!    │                    │                      │
//!    └──reject──▶ REJECTED └────────void─────────┴──▶ VOID
//! ```
//!
//! Transitions are pure: they validate against the current invoice and return
//! the patch to persist plus the audit event to emit. Persisting and emitting
//! is done by [`crate::engine::InvoiceTransitions`].

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    AuditEvent, AuditEventKind, BillingFrequency, DeliveryResult, EmailStatus, Invoice,
    InvoiceStatus, InvoiceUpdate, PaymentDetails,
};

/// Frequencies whose invoices may be sent without human review. Annual
/// invoices always wait for a person to send them, to bound renewal risk.
pub const AUTO_SEND_FREQUENCIES: [BillingFrequency; 2] =
    [BillingFrequency::Monthly, BillingFrequency::Quarterly];

/// Validated transition, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceTransition {
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
    pub update: InvoiceUpdate,
    pub event: Option<AuditEvent>,
}

/// Whether the state machine has an edge `from -> to`.
pub fn can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    use InvoiceStatus::*;
    matches!(
        (from, to),
        (Pending, Approved)
            | (Pending, Rejected)
            | (Approved, Sent)
            | (Sent, Paid)
            | (Approved, Void)
            | (Sent, Void)
    )
}

fn require(
    invoice: &Invoice,
    to: InvoiceStatus,
    action: &'static str,
) -> Result<InvoiceStatus, BillingError> {
    let from = invoice.status();
    if can_transition(from, to) {
        Ok(from)
    } else {
        Err(BillingError::InvalidTransition {
            entity: "invoice",
            from: from.as_str(),
            action,
        })
    }
}

fn required_reason(reason: &str, action: &'static str) -> Result<String, BillingError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(BillingError::MissingReason(action));
    }
    Ok(reason.to_string())
}

/// Approve a pending invoice. `actor` is `None` when the system approves.
pub fn approve(
    invoice: &Invoice,
    actor: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = require(invoice, InvoiceStatus::Approved, "approve")?;
    Ok(InvoiceTransition {
        from,
        to: InvoiceStatus::Approved,
        update: InvoiceUpdate {
            status: Some(InvoiceStatus::Approved),
            approved_by: actor,
            approved_utc: Some(at),
            ..Default::default()
        },
        event: Some(AuditEvent::new(
            AuditEventKind::InvoiceApproved,
            invoice.invoice_id,
            actor,
            at,
        )),
    })
}

/// Reject a pending invoice. A reschedule date may be recorded; the invoice
/// stays REJECTED either way.
pub fn reject(
    invoice: &Invoice,
    actor: Uuid,
    reason: &str,
    reschedule_date: Option<NaiveDate>,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = require(invoice, InvoiceStatus::Rejected, "reject")?;
    let reason = required_reason(reason, "reject an invoice")?;
    Ok(InvoiceTransition {
        from,
        to: InvoiceStatus::Rejected,
        update: InvoiceUpdate {
            status: Some(InvoiceStatus::Rejected),
            rejected_by: Some(actor),
            rejected_utc: Some(at),
            rejection_reason: Some(reason.clone()),
            reschedule_date,
            ..Default::default()
        },
        event: Some(
            AuditEvent::new(
                AuditEventKind::InvoiceRejected,
                invoice.invoice_id,
                Some(actor),
                at,
            )
            .with_detail(reason),
        ),
    })
}

/// Record the outcome of an email delivery attempt.
///
/// A successful delivery moves the invoice to SENT. A failed one keeps it
/// APPROVED and records the error so it can be retried.
pub fn mark_sent(
    invoice: &Invoice,
    delivery: &DeliveryResult,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = require(invoice, InvoiceStatus::Sent, "mark sent")?;

    if !delivery.success {
        return Ok(InvoiceTransition {
            from,
            to: from,
            update: InvoiceUpdate {
                email_status: Some(EmailStatus::Failed),
                email_error: Some(
                    delivery
                        .error
                        .clone()
                        .unwrap_or_else(|| "delivery failed".to_string()),
                ),
                ..Default::default()
            },
            event: None,
        });
    }

    Ok(InvoiceTransition {
        from,
        to: InvoiceStatus::Sent,
        update: InvoiceUpdate {
            status: Some(InvoiceStatus::Sent),
            email_status: Some(EmailStatus::Sent),
            sent_utc: Some(at),
            email_message_id: delivery.message_id.clone(),
            clear_email_error: true,
            ..Default::default()
        },
        event: Some(AuditEvent::new(
            AuditEventKind::InvoiceSent,
            invoice.invoice_id,
            None,
            at,
        )),
    })
}

pub fn mark_paid(
    invoice: &Invoice,
    payment: &PaymentDetails,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = require(invoice, InvoiceStatus::Paid, "mark paid")?;
    if payment.amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "payment amount must be positive, got {}",
            payment.amount
        )));
    }
    let paid_at = payment.paid_at.unwrap_or(at);
    Ok(InvoiceTransition {
        from,
        to: InvoiceStatus::Paid,
        update: InvoiceUpdate {
            status: Some(InvoiceStatus::Paid),
            paid_utc: Some(paid_at),
            paid_amount: Some(payment.amount),
            payment_method: Some(payment.method.clone()),
            payment_reference: payment.reference.clone(),
            ..Default::default()
        },
        event: Some(
            AuditEvent::new(AuditEventKind::InvoicePaid, invoice.invoice_id, None, at)
                .with_detail(format!("{} via {}", payment.amount, payment.method)),
        ),
    })
}

/// Void an approved or sent invoice. Terminal.
pub fn void(
    invoice: &Invoice,
    actor: Uuid,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = require(invoice, InvoiceStatus::Void, "void")?;
    let reason = required_reason(reason, "void an invoice")?;
    Ok(InvoiceTransition {
        from,
        to: InvoiceStatus::Void,
        update: InvoiceUpdate {
            status: Some(InvoiceStatus::Void),
            voided_by: Some(actor),
            voided_utc: Some(at),
            void_reason: Some(reason.clone()),
            ..Default::default()
        },
        event: Some(
            AuditEvent::new(
                AuditEventKind::InvoiceVoid,
                invoice.invoice_id,
                Some(actor),
                at,
            )
            .with_detail(reason),
        ),
    })
}

/// Record a payment reminder on a sent, unpaid invoice. The level climbs with
/// each follow-up up to `max_level`; status is unchanged.
pub fn record_follow_up(
    invoice: &Invoice,
    max_level: i32,
    at: DateTime<Utc>,
) -> Result<InvoiceTransition, BillingError> {
    let from = invoice.status();
    if from != InvoiceStatus::Sent || !invoice.follow_up_enabled {
        return Err(BillingError::InvalidTransition {
            entity: "invoice",
            from: from.as_str(),
            action: "follow up",
        });
    }
    let count = invoice.follow_up_count + 1;
    let level = (invoice.follow_up_level + 1).min(max_level.max(1));
    Ok(InvoiceTransition {
        from,
        to: from,
        update: InvoiceUpdate {
            follow_up_count: Some(count),
            follow_up_level: Some(level),
            last_follow_up_utc: Some(at),
            ..Default::default()
        },
        event: Some(
            AuditEvent::new(
                AuditEventKind::InvoiceFollowUp,
                invoice.invoice_id,
                None,
                at,
            )
            .with_detail(format!("level {}", level)),
        ),
    })
}

/// Automation flags carried by a schedule or ad-hoc request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AutomationFlags {
    pub auto_approve: bool,
    /// Only meaningful together with `auto_approve`.
    pub auto_send_enabled: bool,
}

/// What happens to a freshly created invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPlan {
    /// Created PENDING, waiting for a human.
    AwaitApproval,
    /// Created and approved by the system.
    AutoApprove,
    /// Approved by the system, then sent.
    AutoApproveAndSend,
}

impl CreationPlan {
    pub fn initial_status(&self) -> InvoiceStatus {
        match self {
            CreationPlan::AwaitApproval => InvoiceStatus::Pending,
            CreationPlan::AutoApprove | CreationPlan::AutoApproveAndSend => {
                InvoiceStatus::Approved
            }
        }
    }

    pub fn is_auto_approved(&self) -> bool {
        !matches!(self, CreationPlan::AwaitApproval)
    }

    pub fn sends(&self) -> bool {
        matches!(self, CreationPlan::AutoApproveAndSend)
    }
}

pub fn auto_send_allowed(frequency: Option<BillingFrequency>) -> bool {
    frequency.is_some_and(|f| AUTO_SEND_FREQUENCIES.contains(&f))
}

/// Decide the creation-time branch for a new invoice.
pub fn creation_plan(flags: AutomationFlags, frequency: Option<BillingFrequency>) -> CreationPlan {
    if !flags.auto_approve {
        return CreationPlan::AwaitApproval;
    }
    if flags.auto_send_enabled && auto_send_allowed(frequency) {
        CreationPlan::AutoApproveAndSend
    } else {
        CreationPlan::AutoApprove
    }
}

/// Audit event for an invoice the system approved at creation.
pub fn auto_approval_event(invoice: &Invoice) -> AuditEvent {
    AuditEvent::new(
        AuditEventKind::InvoiceApproved,
        invoice.invoice_id,
        None,
        invoice.approved_utc.unwrap_or(invoice.created_utc),
    )
    .with_detail("auto-approved")
}
