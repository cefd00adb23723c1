//! Run executor: turns due schedules into invoices.
//!
//! Per schedule and occurrence:
//!
//! 1. open a PENDING run for the occurrence's period;
//! 2. skip when a SUCCESS run already exists for the period;
//! 3. compute tax, build the invoice and its line, and create it through the
//!    store, which allocates the billing number and marks the run SUCCESS in
//!    the same unit of work;
//! 4. advance the schedule (or end it when no occurrence remains).
//!
//! A duplicate detected at step 2 or 3 closes the run SKIPPED and still
//! advances. Any other error closes it FAILED and leaves the schedule where it
//! was, so the next sweep retries the same period. Errors never escape the
//! per-schedule boundary of a sweep.

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::invoice_lifecycle::{
    auto_approval_event, creation_plan, AutomationFlags, CreationPlan,
};
use crate::engine::recurrence::{clamp_to_month, next_occurrence, RecurrenceRule};
use crate::engine::schedule_lifecycle::exhausted_event;
use crate::engine::tax::{compute_with_vat_rate, round_money, AmountBasis, TaxBreakdown, TaxInput};
use crate::engine::transitions::InvoiceTransitions;
use crate::error::BillingError;
use crate::models::{
    BeginRun, BillingFrequency, BillingRun, BillingRunType, BillingSchedule, Invoice,
    InvoiceStatus, NewInvoice, NewLineItem, RunOutcome, ScheduleAdvance, ScheduleStatus,
    VatPolicy,
};
use crate::services::audit::{emit, AuditSink};
use crate::services::metrics::{
    record_billing_run, record_error, record_invoice_created, record_invoice_transition,
    record_schedule_transition, SWEEP_DURATION,
};
use crate::services::settings::SettingsCache;
use crate::services::store::BillingStore;

/// Outcome of one schedule within a sweep or a run-now.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRunResult {
    pub schedule_id: Uuid,
    pub run_id: Option<Uuid>,
    pub run_date: Option<NaiveDate>,
    pub period_key: Option<String>,
    pub outcome: RunOutcome,
    pub invoice_id: Option<Uuid>,
    pub billing_number: Option<String>,
    pub invoice_status: Option<InvoiceStatus>,
    pub error: Option<String>,
}

impl ScheduleRunResult {
    fn new(schedule_id: Uuid, outcome: RunOutcome) -> Self {
        Self {
            schedule_id,
            run_id: None,
            run_date: None,
            period_key: None,
            outcome,
            invoice_id: None,
            billing_number: None,
            invoice_status: None,
            error: None,
        }
    }

    fn for_run(run: &BillingRun, outcome: RunOutcome) -> Self {
        Self {
            run_id: Some(run.run_id),
            run_date: Some(run.run_date),
            period_key: Some(run.period_key.clone()),
            ..Self::new(run.schedule_id, outcome)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub as_of: NaiveDate,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<ScheduleRunResult>,
}

impl SweepSummary {
    fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            results: Vec::new(),
        }
    }

    fn push(&mut self, result: ScheduleRunResult) {
        match result.outcome {
            RunOutcome::Success => self.succeeded += 1,
            RunOutcome::Skipped => self.skipped += 1,
            RunOutcome::Failed | RunOutcome::Pending => self.failed += 1,
        }
        self.results.push(result);
    }
}

/// One line of an ad-hoc invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocLine {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

/// Invoice request not backed by a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocInvoiceRequest {
    pub billing_entity_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_emails: Vec<String>,
    pub customer_tin: Option<String>,
    pub statement_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub amount_is_vat_inclusive: bool,
    pub vat_policy: VatPolicy,
    pub has_withholding: bool,
    pub withholding_rate: Option<Decimal>,
    pub withholding_code: Option<String>,
    pub lines: Vec<AdHocLine>,
    /// Without a frequency the invoice is never auto-sent.
    pub billing_frequency: Option<BillingFrequency>,
    pub auto_approve: bool,
    pub auto_send_enabled: bool,
    pub created_by: Option<Uuid>,
}

struct BilledInvoice {
    invoice: Invoice,
    plan: CreationPlan,
}

#[derive(Clone)]
pub struct RunExecutor {
    store: Arc<dyn BillingStore>,
    settings: Arc<SettingsCache>,
    invoices: InvoiceTransitions,
    audit: Arc<dyn AuditSink>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        settings: Arc<SettingsCache>,
        invoices: InvoiceTransitions,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            settings,
            invoices,
            audit,
        }
    }

    /// Bill every ACTIVE schedule due on or before `as_of`, one at a time.
    #[instrument(skip(self), fields(as_of = %as_of))]
    pub async fn execute_due_runs(&self, as_of: NaiveDate) -> Result<SweepSummary, BillingError> {
        let timer = SWEEP_DURATION.start_timer();

        let due = self
            .store
            .list_due_schedules(as_of)
            .await
            .inspect_err(|e| record_error(e.kind(), "execute_due_runs"))?;
        info!(count = due.len(), "Starting billing sweep");

        let mut summary = SweepSummary::new(as_of);
        for schedule in &due {
            let result = self
                .execute_schedule(schedule, BillingRunType::Scheduled)
                .await;
            summary.push(result);
        }

        timer.observe_duration();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Billing sweep completed"
        );
        Ok(summary)
    }

    /// Bill one schedule's current occurrence now, outside the sweep.
    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn run_now(&self, schedule_id: Uuid) -> Result<ScheduleRunResult, BillingError> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))?;
        if schedule.status() != ScheduleStatus::Active || schedule.deleted_utc.is_some() {
            return Err(BillingError::InvalidTransition {
                entity: "schedule",
                from: schedule.status().as_str(),
                action: "run",
            });
        }
        Ok(self
            .execute_schedule(&schedule, BillingRunType::Manual)
            .await)
    }

    /// Run history of a schedule, newest first.
    pub async fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<BillingRun>, BillingError> {
        self.store.list_runs(schedule_id).await
    }

    /// Bill the schedule's `next_billing_date`. Never fails: every error ends
    /// up in the returned result and in the run record.
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.schedule_id, run_type = run_type.as_str()))]
    pub async fn execute_schedule(
        &self,
        schedule: &BillingSchedule,
        run_type: BillingRunType,
    ) -> ScheduleRunResult {
        let Some(occurrence) = schedule.next_billing_date else {
            warn!("Schedule has no next billing date");
            record_billing_run(RunOutcome::Failed.as_str());
            return ScheduleRunResult {
                error: Some("schedule has no next billing date".to_string()),
                ..ScheduleRunResult::new(schedule.schedule_id, RunOutcome::Failed)
            };
        };

        let rule = RecurrenceRule::for_schedule(schedule);
        let period_key = match &rule {
            Ok(rule) => rule.period_key(occurrence),
            Err(_) => occurrence.format("%Y-%m-%d").to_string(),
        };

        let run = match self
            .store
            .begin_run(&BeginRun {
                schedule_id: schedule.schedule_id,
                run_date: occurrence,
                period_key,
                run_type,
            })
            .await
        {
            Ok(run) => run,
            Err(e) => {
                warn!(error = %e, "Failed to open billing run");
                record_billing_run(RunOutcome::Failed.as_str());
                record_error(e.kind(), "begin_run");
                return ScheduleRunResult {
                    run_date: Some(occurrence),
                    error: Some(e.to_string()),
                    ..ScheduleRunResult::new(schedule.schedule_id, RunOutcome::Failed)
                };
            }
        };

        let billed = match rule {
            Ok(rule) => self.bill_occurrence(schedule, &rule, &run, run_type).await,
            Err(e) => Err(e),
        };

        match billed {
            Ok(billed) => self.on_success(schedule, &run, billed).await,
            Err(BillingError::DuplicateRun { period_key, .. }) => {
                self.on_duplicate(schedule, &run, &period_key).await
            }
            Err(e) => self.on_failure(&run, e).await,
        }
    }

    async fn bill_occurrence(
        &self,
        schedule: &BillingSchedule,
        rule: &RecurrenceRule,
        run: &BillingRun,
        run_type: BillingRunType,
    ) -> Result<BilledInvoice, BillingError> {
        if let Some(existing) = self
            .store
            .find_success_run(schedule.schedule_id, &run.period_key)
            .await?
        {
            debug!(existing_run_id = %existing.run_id, "Period already billed");
            return Err(BillingError::DuplicateRun {
                schedule_id: schedule.schedule_id,
                period_key: run.period_key.clone(),
            });
        }

        let occurrence = run.run_date;
        let withholding_rate = self
            .resolve_withholding(
                schedule.has_withholding,
                schedule.withholding_rate,
                schedule.withholding_code.as_deref(),
            )
            .await?;
        let vat_rate = self.settings.vat_rate().await?;
        let breakdown = compute_with_vat_rate(
            &TaxInput {
                billing_amount: schedule.billing_amount,
                basis: AmountBasis::from_inclusive_flag(schedule.amount_is_vat_inclusive),
                vat_policy: schedule.vat_policy(),
                has_withholding: schedule.has_withholding,
                withholding_rate,
            },
            vat_rate,
        )?;

        let period_end = rule
            .next_occurrence(Some(occurrence))
            .and_then(|next| next.pred_opt())
            .or(schedule.end_date);
        let due_days = self.settings.invoice_due_days().await?;
        let due = due_date(occurrence, schedule.due_day_of_month, due_days);

        let frequency = schedule.frequency();
        let plan = creation_plan(
            AutomationFlags {
                auto_approve: schedule.auto_approve,
                auto_send_enabled: schedule.auto_send_enabled,
            },
            Some(frequency),
        );

        let lines = vec![NewLineItem {
            description: schedule.description.clone(),
            quantity: Decimal::ONE,
            unit_price: breakdown.service_fee,
            service_fee: breakdown.service_fee,
            vat_amount: breakdown.vat_amount,
            withholding_tax: breakdown.withholding_tax,
            amount: breakdown.gross_amount,
            sort_order: 0,
        }];
        verify_line_totals(&breakdown, &lines)?;

        let new_invoice = NewInvoice {
            billing_entity_id: schedule.billing_entity_id,
            schedule_id: Some(schedule.schedule_id),
            contract_id: Some(schedule.contract_id),
            customer_name: schedule.customer_name.clone(),
            customer_address: schedule.customer_address.clone(),
            customer_emails: schedule.customer_emails.clone(),
            customer_tin: schedule.customer_tin.clone(),
            statement_date: occurrence,
            due_date: due,
            period_start: Some(occurrence),
            period_end,
            billing_frequency: Some(frequency),
            service_fee: breakdown.service_fee,
            vat_amount: breakdown.vat_amount,
            gross_amount: breakdown.gross_amount,
            withholding_tax: breakdown.withholding_tax,
            net_amount: breakdown.net_amount,
            vat_policy: schedule.vat_policy(),
            has_withholding: schedule.has_withholding,
            withholding_rate,
            withholding_code: schedule.withholding_code.clone(),
            status: plan.initial_status(),
            approved_utc: plan.is_auto_approved().then(Utc::now),
            follow_up_enabled: true,
            created_by: None,
        };

        let invoice = self
            .store
            .create_invoice(&new_invoice, &lines, Some(run.run_id))
            .await?;
        record_invoice_created(run_type.as_str(), invoice.status.as_str());

        Ok(BilledInvoice { invoice, plan })
    }

    async fn on_success(
        &self,
        schedule: &BillingSchedule,
        run: &BillingRun,
        billed: BilledInvoice,
    ) -> ScheduleRunResult {
        let BilledInvoice { invoice, plan } = billed;
        record_billing_run(RunOutcome::Success.as_str());
        info!(
            run_id = %run.run_id,
            invoice_id = %invoice.invoice_id,
            billing_number = %invoice.billing_number,
            period_key = %run.period_key,
            "Billing run succeeded"
        );

        if let Err(e) = self.advance(schedule, run.run_date, true).await {
            // The SUCCESS run makes the next sweep skip and advance.
            warn!(error = %e, "Failed to advance schedule after billing");
            record_error(e.kind(), "advance_schedule");
        }

        let status = self.after_create(&invoice, plan).await;

        ScheduleRunResult {
            invoice_id: Some(invoice.invoice_id),
            billing_number: Some(invoice.billing_number.clone()),
            invoice_status: Some(status),
            ..ScheduleRunResult::for_run(run, RunOutcome::Success)
        }
    }

    async fn on_duplicate(
        &self,
        schedule: &BillingSchedule,
        run: &BillingRun,
        period_key: &str,
    ) -> ScheduleRunResult {
        let message = format!("period {} already billed", period_key);
        if let Err(e) = self
            .store
            .finalize_run(run.run_id, RunOutcome::Skipped, None, Some(&message))
            .await
        {
            warn!(error = %e, "Failed to record skipped run");
        }
        if let Err(e) = self.advance(schedule, run.run_date, false).await {
            warn!(error = %e, "Failed to advance schedule past billed period");
            record_error(e.kind(), "advance_schedule");
        }

        record_billing_run(RunOutcome::Skipped.as_str());
        info!(run_id = %run.run_id, period_key = %period_key, "Billing run skipped");
        ScheduleRunResult {
            error: Some(message),
            ..ScheduleRunResult::for_run(run, RunOutcome::Skipped)
        }
    }

    async fn on_failure(&self, run: &BillingRun, error: BillingError) -> ScheduleRunResult {
        let message = error.to_string();
        if let Err(e) = self
            .store
            .finalize_run(run.run_id, RunOutcome::Failed, None, Some(&message))
            .await
        {
            warn!(error = %e, "Failed to record failed run");
        }

        record_billing_run(RunOutcome::Failed.as_str());
        record_error(error.kind(), "execute_schedule");
        warn!(
            run_id = %run.run_id,
            period_key = %run.period_key,
            error = %message,
            "Billing run failed"
        );
        ScheduleRunResult {
            error: Some(message),
            ..ScheduleRunResult::for_run(run, RunOutcome::Failed)
        }
    }

    /// Move the schedule past `occurrence`, ending it when nothing follows.
    /// Losing the compare-and-set to a concurrent run is not an error.
    async fn advance(
        &self,
        schedule: &BillingSchedule,
        occurrence: NaiveDate,
        increment_run_count: bool,
    ) -> Result<(), BillingError> {
        let next = next_occurrence(schedule, Some(occurrence))?;
        let moved = self
            .store
            .advance_schedule(
                schedule.schedule_id,
                occurrence,
                &ScheduleAdvance {
                    next_billing_date: next,
                    increment_run_count,
                },
            )
            .await?;

        if !moved {
            debug!("Schedule already advanced by another run");
            return Ok(());
        }
        match next {
            Some(next) => debug!(next_billing_date = %next, "Schedule advanced"),
            None => {
                info!("Schedule date range exhausted, ending schedule");
                record_schedule_transition("exhausted");
                emit(self.audit.as_ref(), &exhausted_event(schedule, Utc::now())).await;
            }
        }
        Ok(())
    }

    /// Creation-time automation. Returns the invoice's resulting status.
    async fn after_create(&self, invoice: &Invoice, plan: CreationPlan) -> InvoiceStatus {
        if plan.is_auto_approved() {
            record_invoice_transition("auto_approve");
            emit(self.audit.as_ref(), &auto_approval_event(invoice)).await;
        }
        if !plan.sends() {
            return invoice.status();
        }
        match self.invoices.send(invoice.invoice_id).await {
            Ok(sent) => sent.status(),
            Err(e) => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Auto-send failed, invoice left approved"
                );
                InvoiceStatus::Approved
            }
        }
    }

    async fn resolve_withholding(
        &self,
        has_withholding: bool,
        rate: Option<Decimal>,
        code: Option<&str>,
    ) -> Result<Option<Decimal>, BillingError> {
        if !has_withholding {
            return Ok(None);
        }
        if let Some(rate) = rate {
            return Ok(Some(rate));
        }
        let code = code.filter(|c| !c.trim().is_empty()).ok_or_else(|| {
            BillingError::InvalidRate("withholding requires a rate or a tax code".to_string())
        })?;
        self.settings
            .withholding_preset(code)
            .await?
            .map(Some)
            .ok_or_else(|| {
                BillingError::InvalidRate(format!("no withholding preset for code {}", code))
            })
    }

    /// Create an invoice outside of any schedule, with one line per request
    /// line. The invoice totals are the sum of the per-line breakdowns.
    #[instrument(skip(self, request), fields(entity_id = %request.billing_entity_id))]
    pub async fn generate_adhoc(
        &self,
        request: &AdHocInvoiceRequest,
    ) -> Result<Invoice, BillingError> {
        if request.lines.is_empty() {
            return Err(BillingError::InvalidAmount(
                "an invoice needs at least one line".to_string(),
            ));
        }

        let withholding_rate = self
            .resolve_withholding(
                request.has_withholding,
                request.withholding_rate,
                request.withholding_code.as_deref(),
            )
            .await?;
        let vat_rate = self.settings.vat_rate().await?;

        let mut total = TaxBreakdown::zero();
        let mut lines = Vec::with_capacity(request.lines.len());
        for (index, line) in request.lines.iter().enumerate() {
            if line.quantity <= Decimal::ZERO {
                return Err(BillingError::InvalidAmount(format!(
                    "line {} quantity must be positive, got {}",
                    index + 1,
                    line.quantity
                )));
            }
            let amount = round_money(line.quantity * line.unit_price);
            let breakdown = compute_with_vat_rate(
                &TaxInput {
                    billing_amount: amount,
                    basis: AmountBasis::from_inclusive_flag(request.amount_is_vat_inclusive),
                    vat_policy: request.vat_policy,
                    has_withholding: request.has_withholding,
                    withholding_rate,
                },
                vat_rate,
            )?;
            total = total.add(&breakdown);
            lines.push(NewLineItem {
                description: line.description.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                service_fee: breakdown.service_fee,
                vat_amount: breakdown.vat_amount,
                withholding_tax: breakdown.withholding_tax,
                amount: breakdown.gross_amount,
                sort_order: index as i32,
            });
        }
        verify_line_totals(&total, &lines)?;

        let due_days = self.settings.invoice_due_days().await?;
        let plan = creation_plan(
            AutomationFlags {
                auto_approve: request.auto_approve,
                auto_send_enabled: request.auto_send_enabled,
            },
            request.billing_frequency,
        );

        let new_invoice = NewInvoice {
            billing_entity_id: request.billing_entity_id,
            schedule_id: None,
            contract_id: request.contract_id,
            customer_name: request.customer_name.clone(),
            customer_address: request.customer_address.clone(),
            customer_emails: request.customer_emails.clone(),
            customer_tin: request.customer_tin.clone(),
            statement_date: request.statement_date,
            due_date: request
                .due_date
                .unwrap_or_else(|| due_date(request.statement_date, None, due_days)),
            period_start: None,
            period_end: None,
            billing_frequency: request.billing_frequency,
            service_fee: total.service_fee,
            vat_amount: total.vat_amount,
            gross_amount: total.gross_amount,
            withholding_tax: total.withholding_tax,
            net_amount: total.net_amount,
            vat_policy: request.vat_policy,
            has_withholding: request.has_withholding,
            withholding_rate,
            withholding_code: request.withholding_code.clone(),
            status: plan.initial_status(),
            approved_utc: plan.is_auto_approved().then(Utc::now),
            follow_up_enabled: true,
            created_by: request.created_by,
        };

        let invoice = self
            .store
            .create_invoice(&new_invoice, &lines, None)
            .await
            .inspect_err(|e| record_error(e.kind(), "generate_adhoc"))?;
        record_invoice_created("adhoc", invoice.status.as_str());
        info!(
            invoice_id = %invoice.invoice_id,
            billing_number = %invoice.billing_number,
            "Ad-hoc invoice created"
        );

        let status = self.after_create(&invoice, plan).await;
        if status == invoice.status() {
            return Ok(invoice);
        }
        self.store
            .get_invoice(invoice.invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice.invoice_id)))
    }
}

/// Due date of an invoice: the first `due_day` strictly after the statement
/// date (clamped to month end), or `default_days` after it.
pub fn due_date(statement: NaiveDate, due_day: Option<i32>, default_days: i64) -> NaiveDate {
    let fallback = || {
        Duration::try_days(default_days)
            .and_then(|days| statement.checked_add_signed(days))
            .unwrap_or(statement)
    };
    let Some(day) = due_day.and_then(|d| u32::try_from(d).ok()).filter(|d| (1..=31).contains(d))
    else {
        return fallback();
    };

    match clamp_to_month(statement.year(), statement.month(), day) {
        Some(candidate) if candidate > statement => candidate,
        _ => {
            let (year, month) = if statement.month() == 12 {
                (statement.year() + 1, 1)
            } else {
                (statement.year(), statement.month() + 1)
            };
            clamp_to_month(year, month, day).unwrap_or_else(fallback)
        }
    }
}

/// Line subtotals must add up to the invoice breakdown to the cent.
pub fn verify_line_totals(
    breakdown: &TaxBreakdown,
    lines: &[NewLineItem],
) -> Result<(), BillingError> {
    let fee: Decimal = lines.iter().map(|l| l.service_fee).sum();
    let vat: Decimal = lines.iter().map(|l| l.vat_amount).sum();
    let withholding: Decimal = lines.iter().map(|l| l.withholding_tax).sum();
    let gross: Decimal = lines.iter().map(|l| l.amount).sum();

    if fee != breakdown.service_fee
        || vat != breakdown.vat_amount
        || withholding != breakdown.withholding_tax
        || gross != breakdown.gross_amount
    {
        return Err(BillingError::InvalidAmount(format!(
            "line items total {} (fee {}, vat {}, withholding {}) do not match invoice gross {}",
            gross, fee, vat, withholding, breakdown.gross_amount
        )));
    }
    Ok(())
}
