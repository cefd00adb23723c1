//! Lifecycle services: load a record, apply a transition, persist it
//! conditionally on the status it was validated against, then emit the audit
//! event.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::invoice_lifecycle::{self, InvoiceTransition};
use crate::engine::recurrence::{cadence_for, RecurrenceRule};
use crate::engine::schedule_lifecycle::{self, ScheduleTransition};
use crate::engine::tax::validate_withholding_rate;
use crate::error::BillingError;
use crate::models::{
    BillingSchedule, CreateSchedule, DeliveryResult, Invoice, InvoiceStatus, PaymentDetails,
};
use crate::services::audit::{emit, AuditSink};
use crate::services::delivery::InvoiceMailer;
use crate::services::metrics::{record_error, record_invoice_transition, record_schedule_transition};
use crate::services::settings::SettingsCache;
use crate::services::store::BillingStore;

// =============================================================================
// Invoices
// =============================================================================

#[derive(Clone)]
pub struct InvoiceTransitions {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn AuditSink>,
    settings: Arc<SettingsCache>,
    mailer: InvoiceMailer,
}

impl InvoiceTransitions {
    pub fn new(
        store: Arc<dyn BillingStore>,
        audit: Arc<dyn AuditSink>,
        settings: Arc<SettingsCache>,
        mailer: InvoiceMailer,
    ) -> Self {
        Self {
            store,
            audit,
            settings,
            mailer,
        }
    }

    async fn load(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))
    }

    async fn commit(
        &self,
        action: &'static str,
        invoice_id: Uuid,
        transition: Result<InvoiceTransition, BillingError>,
    ) -> Result<Invoice, BillingError> {
        let transition = transition.inspect_err(|e| record_error(e.kind(), action))?;
        let updated = self
            .store
            .update_invoice_state(invoice_id, transition.from, &transition.update)
            .await
            .inspect_err(|e| record_error(e.kind(), action))?;

        record_invoice_transition(action);
        if let Some(event) = &transition.event {
            emit(self.audit.as_ref(), event).await;
        }
        info!(
            invoice_id = %invoice_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            action = action,
            "Invoice transition"
        );
        Ok(updated)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn approve(
        &self,
        invoice_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let t = invoice_lifecycle::approve(&invoice, actor, Utc::now());
        self.commit("approve", invoice_id, t).await
    }

    #[instrument(skip(self, reason), fields(invoice_id = %invoice_id))]
    pub async fn reject(
        &self,
        invoice_id: Uuid,
        actor: Uuid,
        reason: &str,
        reschedule_date: Option<NaiveDate>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let t = invoice_lifecycle::reject(&invoice, actor, reason, reschedule_date, Utc::now());
        self.commit("reject", invoice_id, t).await
    }

    /// Record a delivery attempt made elsewhere.
    #[instrument(skip(self, delivery), fields(invoice_id = %invoice_id))]
    pub async fn record_delivery(
        &self,
        invoice_id: Uuid,
        delivery: &DeliveryResult,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let t = invoice_lifecycle::mark_sent(&invoice, delivery, Utc::now());
        let action = if delivery.success {
            "mark_sent"
        } else {
            "delivery_failed"
        };
        self.commit(action, invoice_id, t).await
    }

    /// Email an approved invoice and record the outcome. A failed delivery is
    /// recorded on the invoice (it stays APPROVED) and returned as
    /// `DeliveryFailure`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        if !invoice_lifecycle::can_transition(invoice.status(), InvoiceStatus::Sent) {
            return Err(BillingError::InvalidTransition {
                entity: "invoice",
                from: invoice.status().as_str(),
                action: "send",
            });
        }

        let lines = self.store.get_line_items(invoice_id).await?;
        let delivery = self.mailer.deliver(&invoice, &lines).await;
        let t = invoice_lifecycle::mark_sent(&invoice, &delivery, Utc::now());

        if delivery.success {
            return self.commit("mark_sent", invoice_id, t).await;
        }

        self.commit("delivery_failed", invoice_id, t).await?;
        let error = delivery
            .error
            .unwrap_or_else(|| "delivery failed".to_string());
        warn!(invoice_id = %invoice_id, error = %error, "Invoice delivery failed");
        record_error("delivery", "send");
        Err(BillingError::DeliveryFailure(error))
    }

    #[instrument(skip(self, payment), fields(invoice_id = %invoice_id))]
    pub async fn mark_paid(
        &self,
        invoice_id: Uuid,
        payment: &PaymentDetails,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let t = invoice_lifecycle::mark_paid(&invoice, payment, Utc::now());
        self.commit("mark_paid", invoice_id, t).await
    }

    #[instrument(skip(self, reason), fields(invoice_id = %invoice_id))]
    pub async fn void(
        &self,
        invoice_id: Uuid,
        actor: Uuid,
        reason: &str,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let t = invoice_lifecycle::void(&invoice, actor, reason, Utc::now());
        self.commit("void", invoice_id, t).await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn record_follow_up(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let invoice = self.load(invoice_id).await?;
        let max_level = self.settings.follow_up_max_level().await?;
        let t = invoice_lifecycle::record_follow_up(&invoice, max_level, Utc::now());
        self.commit("follow_up", invoice_id, t).await
    }
}

// =============================================================================
// Schedules
// =============================================================================

#[derive(Clone)]
pub struct ScheduleTransitions {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn AuditSink>,
}

impl ScheduleTransitions {
    pub fn new(store: Arc<dyn BillingStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    async fn load(&self, schedule_id: Uuid) -> Result<BillingSchedule, BillingError> {
        self.store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))
    }

    async fn commit(
        &self,
        action: &'static str,
        schedule_id: Uuid,
        transition: Result<ScheduleTransition, BillingError>,
    ) -> Result<BillingSchedule, BillingError> {
        let transition = transition.inspect_err(|e| record_error(e.kind(), action))?;
        let updated = self
            .store
            .update_schedule_state(schedule_id, transition.from, &transition.update)
            .await
            .inspect_err(|e| record_error(e.kind(), action))?;

        record_schedule_transition(action);
        emit(self.audit.as_ref(), &transition.event).await;
        info!(
            schedule_id = %schedule_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            action = action,
            "Schedule transition"
        );
        Ok(updated)
    }

    /// Validate and store a new PENDING schedule.
    #[instrument(skip(self, input), fields(contract_id = %input.contract_id))]
    pub async fn create(&self, input: &CreateSchedule) -> Result<BillingSchedule, BillingError> {
        validate_schedule(input)?;
        if self
            .store
            .get_billing_entity(input.billing_entity_id)
            .await?
            .is_none()
        {
            return Err(BillingError::UnknownBillingEntity(input.billing_entity_id));
        }
        let schedule = self.store.insert_schedule(input).await?;
        record_schedule_transition("create");
        info!(schedule_id = %schedule.schedule_id, "Schedule created");
        Ok(schedule)
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn approve(
        &self,
        schedule_id: Uuid,
        actor: Uuid,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::approve(&schedule, actor, Utc::now());
        self.commit("approve", schedule_id, t).await
    }

    #[instrument(skip(self, reason), fields(schedule_id = %schedule_id))]
    pub async fn reject(
        &self,
        schedule_id: Uuid,
        actor: Uuid,
        reason: Option<&str>,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::reject(&schedule, actor, reason, Utc::now());
        self.commit("reject", schedule_id, t).await
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn pause(
        &self,
        schedule_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::pause(&schedule, actor, Utc::now());
        self.commit("pause", schedule_id, t).await
    }

    /// Resume as of today.
    pub async fn resume(
        &self,
        schedule_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<BillingSchedule, BillingError> {
        self.resume_on(schedule_id, actor, Utc::now().date_naive())
            .await
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn resume_on(
        &self,
        schedule_id: Uuid,
        actor: Option<Uuid>,
        today: NaiveDate,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::resume(&schedule, actor, today, Utc::now());
        self.commit("resume", schedule_id, t).await
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn end(
        &self,
        schedule_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::end(&schedule, actor, Utc::now());
        self.commit("end", schedule_id, t).await
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn delete(
        &self,
        schedule_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<BillingSchedule, BillingError> {
        let schedule = self.load(schedule_id).await?;
        let t = schedule_lifecycle::delete(&schedule, actor, Utc::now());
        self.commit("delete", schedule_id, t).await
    }
}

/// Field checks for a new schedule. Withholding may be given as an explicit
/// rate or as a preset code resolved at billing time.
pub fn validate_schedule(input: &CreateSchedule) -> Result<(), BillingError> {
    if input.billing_amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "billing amount must be positive, got {}",
            input.billing_amount
        )));
    }
    if input.has_withholding {
        match (input.withholding_rate, &input.withholding_code) {
            (Some(rate), _) => validate_withholding_rate(rate)?,
            (None, Some(code)) if !code.trim().is_empty() => {}
            _ => {
                return Err(BillingError::InvalidRate(
                    "withholding requires a rate or a tax code".to_string(),
                ))
            }
        }
    }
    if let Some(due_day) = input.due_day_of_month {
        if !(1..=31).contains(&due_day) {
            return Err(BillingError::InvalidSchedule(format!(
                "due day of month must be between 1 and 31, got {}",
                due_day
            )));
        }
    }
    if let Some(end) = input.end_date {
        if end < input.start_date {
            return Err(BillingError::InvalidSchedule(format!(
                "end date {} is before start date {}",
                end, input.start_date
            )));
        }
    }

    let cadence = cadence_for(
        input.frequency,
        input.custom_interval_value,
        input.custom_interval_unit,
    )?;
    let billing_day = u32::try_from(input.billing_day_of_month).map_err(|_| {
        BillingError::InvalidSchedule(format!(
            "billing day of month must be between 1 and 31, got {}",
            input.billing_day_of_month
        ))
    })?;
    RecurrenceRule::new(cadence, billing_day, input.start_date, input.end_date)?;
    Ok(())
}
