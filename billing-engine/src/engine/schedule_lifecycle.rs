//! Billing schedule state machine.
//!
//! ```text
//! PENDING ──approve──▶ ACTIVE ◀──pause/resume──▶ PAUSED
//!    │                   │                          │
//!    └──reject──▶ ENDED ◀┴──────end / exhausted─────┘
//! ```
//!
//! Only ACTIVE schedules are selected by the sweep. ENDED is terminal.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::engine::recurrence::RecurrenceRule;
use crate::error::BillingError;
use crate::models::{AuditEvent, AuditEventKind, BillingSchedule, ScheduleStatus, ScheduleUpdate};

/// Validated transition, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTransition {
    pub from: ScheduleStatus,
    pub to: ScheduleStatus,
    pub update: ScheduleUpdate,
    pub event: AuditEvent,
}

pub fn can_transition(from: ScheduleStatus, to: ScheduleStatus) -> bool {
    use ScheduleStatus::*;
    matches!(
        (from, to),
        (Pending, Active)
            | (Pending, Ended)
            | (Active, Paused)
            | (Paused, Active)
            | (Active, Ended)
            | (Paused, Ended)
    )
}

fn require(
    schedule: &BillingSchedule,
    from: ScheduleStatus,
    to: ScheduleStatus,
    action: &'static str,
) -> Result<ScheduleStatus, BillingError> {
    let current = schedule.status();
    if current == from && can_transition(from, to) {
        Ok(from)
    } else {
        Err(BillingError::InvalidTransition {
            entity: "schedule",
            from: current.as_str(),
            action,
        })
    }
}

/// Activate a pending schedule and store its first billing date.
pub fn approve(
    schedule: &BillingSchedule,
    actor: Uuid,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    let from = require(schedule, ScheduleStatus::Pending, ScheduleStatus::Active, "approve")?;
    let first = RecurrenceRule::for_schedule(schedule)?
        .first_occurrence()
        .ok_or_else(|| {
            BillingError::InvalidSchedule(format!(
                "no billing date between {} and {}",
                schedule.start_date,
                schedule
                    .end_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "open end".to_string())
            ))
        })?;

    Ok(ScheduleTransition {
        from,
        to: ScheduleStatus::Active,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Active),
            next_billing_date: Some(first),
            approved_by: Some(actor),
            approved_utc: Some(at),
            ..Default::default()
        },
        event: AuditEvent::new(
            AuditEventKind::ScheduleApproved,
            schedule.schedule_id,
            Some(actor),
            at,
        )
        .with_detail(format!("first billing date {}", first)),
    })
}

pub fn reject(
    schedule: &BillingSchedule,
    actor: Uuid,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    if schedule.status() != ScheduleStatus::Pending {
        return Err(BillingError::InvalidTransition {
            entity: "schedule",
            from: schedule.status().as_str(),
            action: "reject",
        });
    }
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    let mut event = AuditEvent::new(
        AuditEventKind::ScheduleRejected,
        schedule.schedule_id,
        Some(actor),
        at,
    );
    if let Some(reason) = &reason {
        event = event.with_detail(reason.clone());
    }

    Ok(ScheduleTransition {
        from: ScheduleStatus::Pending,
        to: ScheduleStatus::Ended,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Ended),
            rejection_reason: reason,
            ..Default::default()
        },
        event,
    })
}

pub fn pause(
    schedule: &BillingSchedule,
    actor: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    let from = require(schedule, ScheduleStatus::Active, ScheduleStatus::Paused, "pause")?;
    Ok(ScheduleTransition {
        from,
        to: ScheduleStatus::Paused,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Paused),
            ..Default::default()
        },
        event: AuditEvent::new(
            AuditEventKind::SchedulePaused,
            schedule.schedule_id,
            actor,
            at,
        ),
    })
}

/// Reactivate a paused schedule.
///
/// Occurrences that fell in the past while paused are not billed: the next
/// billing date moves to the first occurrence on or after `today`. When the
/// date range ran out during the pause the schedule ends instead.
pub fn resume(
    schedule: &BillingSchedule,
    actor: Option<Uuid>,
    today: NaiveDate,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    let from = require(schedule, ScheduleStatus::Paused, ScheduleStatus::Active, "resume")?;

    let next = match schedule.next_billing_date {
        Some(next) if next >= today => Some(next),
        _ => RecurrenceRule::for_schedule(schedule)?.first_on_or_after(today),
    };

    let Some(next) = next else {
        return Ok(ScheduleTransition {
            from,
            to: ScheduleStatus::Ended,
            update: ScheduleUpdate {
                status: Some(ScheduleStatus::Ended),
                ..Default::default()
            },
            event: AuditEvent::new(
                AuditEventKind::ScheduleEnded,
                schedule.schedule_id,
                actor,
                at,
            )
            .with_detail("date range exhausted while paused"),
        });
    };

    Ok(ScheduleTransition {
        from,
        to: ScheduleStatus::Active,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Active),
            next_billing_date: Some(next),
            ..Default::default()
        },
        event: AuditEvent::new(
            AuditEventKind::ScheduleResumed,
            schedule.schedule_id,
            actor,
            at,
        )
        .with_detail(format!("next billing date {}", next)),
    })
}

/// End a pending, active or paused schedule. Irreversible.
pub fn end(
    schedule: &BillingSchedule,
    actor: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    let from = schedule.status();
    if from.is_terminal() {
        return Err(BillingError::InvalidTransition {
            entity: "schedule",
            from: from.as_str(),
            action: "end",
        });
    }
    Ok(ScheduleTransition {
        from,
        to: ScheduleStatus::Ended,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Ended),
            ..Default::default()
        },
        event: AuditEvent::new(
            AuditEventKind::ScheduleEnded,
            schedule.schedule_id,
            actor,
            at,
        ),
    })
}

/// Soft delete: the schedule ends and is stamped deleted. An already ended
/// schedule can still be deleted once.
pub fn delete(
    schedule: &BillingSchedule,
    actor: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<ScheduleTransition, BillingError> {
    let from = schedule.status();
    if schedule.deleted_utc.is_some() {
        return Err(BillingError::InvalidTransition {
            entity: "schedule",
            from: from.as_str(),
            action: "delete",
        });
    }
    Ok(ScheduleTransition {
        from,
        to: ScheduleStatus::Ended,
        update: ScheduleUpdate {
            status: Some(ScheduleStatus::Ended),
            deleted_utc: Some(at),
            ..Default::default()
        },
        event: AuditEvent::new(
            AuditEventKind::ScheduleEnded,
            schedule.schedule_id,
            actor,
            at,
        )
        .with_detail("deleted"),
    })
}

/// Event for a schedule the executor ended because no occurrence remains.
pub fn exhausted_event(schedule: &BillingSchedule, at: DateTime<Utc>) -> AuditEvent {
    AuditEvent::new(
        AuditEventKind::ScheduleEnded,
        schedule.schedule_id,
        None,
        at,
    )
    .with_detail("date range exhausted")
}
