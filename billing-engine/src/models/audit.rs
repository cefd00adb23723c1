//! Audit events emitted on every lifecycle transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    InvoiceApproved,
    InvoiceRejected,
    InvoiceSent,
    InvoicePaid,
    InvoiceVoid,
    InvoiceFollowUp,
    ScheduleApproved,
    ScheduleRejected,
    SchedulePaused,
    ScheduleResumed,
    ScheduleEnded,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::InvoiceApproved => "INVOICE_APPROVED",
            AuditEventKind::InvoiceRejected => "INVOICE_REJECTED",
            AuditEventKind::InvoiceSent => "INVOICE_SENT",
            AuditEventKind::InvoicePaid => "INVOICE_PAID",
            AuditEventKind::InvoiceVoid => "INVOICE_VOID",
            AuditEventKind::InvoiceFollowUp => "INVOICE_FOLLOW_UP",
            AuditEventKind::ScheduleApproved => "SCHEDULE_APPROVED",
            AuditEventKind::ScheduleRejected => "SCHEDULE_REJECTED",
            AuditEventKind::SchedulePaused => "SCHEDULE_PAUSED",
            AuditEventKind::ScheduleResumed => "SCHEDULE_RESUMED",
            AuditEventKind::ScheduleEnded => "SCHEDULE_ENDED",
        }
    }
}

/// One state transition, as seen by downstream display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub subject_id: Uuid,
    /// `None` when the system acted (automation, sweep).
    pub actor_id: Option<Uuid>,
    pub detail: Option<String>,
    pub occurred_utc: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        kind: AuditEventKind,
        subject_id: Uuid,
        actor_id: Option<Uuid>,
        occurred_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            subject_id,
            actor_id,
            detail: None,
            occurred_utc,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
