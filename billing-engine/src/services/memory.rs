//! In-process `BillingStore`.
//!
//! Each operation takes the state lock once and releases it before returning,
//! so every method is atomic the same way a single SQL statement or
//! transaction is. Every call yields to the runtime first, which gives
//! concurrent callers the same interleaving points a database round trip would.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use uuid::Uuid;

use crate::engine::billing_number::format_billing_number;
use crate::error::BillingError;
use crate::models::{
    AllocatedSequence, BeginRun, BillingEntity, BillingRun, BillingSchedule, CreateBillingEntity,
    CreateSchedule, EmailStatus, Invoice, InvoiceLineItem, InvoiceStatus, InvoiceUpdate,
    NewInvoice, NewLineItem, RunOutcome, ScheduleAdvance, ScheduleStatus, ScheduleUpdate,
};
use crate::services::store::BillingStore;

#[derive(Default)]
struct State {
    entities: HashMap<Uuid, BillingEntity>,
    schedules: HashMap<Uuid, BillingSchedule>,
    runs: HashMap<Uuid, BillingRun>,
    invoices: HashMap<Uuid, Invoice>,
    line_items: HashMap<Uuid, Vec<InvoiceLineItem>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BillingError> {
        self.state
            .lock()
            .map_err(|_| BillingError::persistence("in-memory store", "state lock poisoned"))
    }

    /// Every invoice in the store, ordered by billing number.
    pub fn all_invoices(&self) -> Result<Vec<Invoice>, BillingError> {
        let state = self.lock()?;
        let mut invoices: Vec<Invoice> = state.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| a.billing_number.cmp(&b.billing_number));
        Ok(invoices)
    }
}

fn next_sequence(entity: &mut BillingEntity) -> AllocatedSequence {
    let sequence = entity.next_sequence;
    entity.next_sequence += 1;
    AllocatedSequence {
        prefix: entity.invoice_prefix.clone(),
        sequence,
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), BillingError> {
        self.lock().map(|_| ())
    }

    async fn insert_billing_entity(
        &self,
        input: &CreateBillingEntity,
    ) -> Result<BillingEntity, BillingError> {
        tokio::task::yield_now().await;
        let entity = BillingEntity {
            entity_id: Uuid::new_v4(),
            name: input.name.clone(),
            invoice_prefix: input.invoice_prefix.clone(),
            tin: input.tin.clone(),
            next_sequence: 1,
            created_utc: Utc::now(),
        };
        self.lock()?
            .entities
            .insert(entity.entity_id, entity.clone());
        Ok(entity)
    }

    async fn get_billing_entity(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<BillingEntity>, BillingError> {
        tokio::task::yield_now().await;
        Ok(self.lock()?.entities.get(&entity_id).cloned())
    }

    async fn allocate_sequence(&self, entity_id: Uuid) -> Result<AllocatedSequence, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;
        let entity = state
            .entities
            .get_mut(&entity_id)
            .ok_or(BillingError::UnknownBillingEntity(entity_id))?;
        Ok(next_sequence(entity))
    }

    async fn insert_schedule(
        &self,
        input: &CreateSchedule,
    ) -> Result<BillingSchedule, BillingError> {
        tokio::task::yield_now().await;
        let now = Utc::now();
        let schedule = BillingSchedule {
            schedule_id: Uuid::new_v4(),
            contract_id: input.contract_id,
            billing_entity_id: input.billing_entity_id,
            customer_name: input.customer_name.clone(),
            customer_address: input.customer_address.clone(),
            customer_emails: input.customer_emails.clone(),
            customer_tin: input.customer_tin.clone(),
            description: input.description.clone(),
            billing_amount: input.billing_amount,
            amount_is_vat_inclusive: input.amount_is_vat_inclusive,
            vat_policy: input.vat_policy.as_str().to_string(),
            has_withholding: input.has_withholding,
            withholding_rate: input.withholding_rate,
            withholding_code: input.withholding_code.clone(),
            frequency: input.frequency.as_str().to_string(),
            custom_interval_value: input.custom_interval_value,
            custom_interval_unit: input.custom_interval_unit.map(|u| u.as_str().to_string()),
            billing_day_of_month: input.billing_day_of_month,
            due_day_of_month: input.due_day_of_month,
            start_date: input.start_date,
            end_date: input.end_date,
            next_billing_date: None,
            auto_approve: input.auto_approve,
            auto_send_enabled: input.auto_send_enabled,
            status: ScheduleStatus::Pending.as_str().to_string(),
            run_count: 0,
            created_by: input.created_by,
            approved_by: None,
            approved_utc: None,
            rejection_reason: None,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        };
        self.lock()?
            .schedules
            .insert(schedule.schedule_id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<BillingSchedule>, BillingError> {
        tokio::task::yield_now().await;
        Ok(self.lock()?.schedules.get(&schedule_id).cloned())
    }

    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<BillingSchedule>, BillingError> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        let mut due: Vec<BillingSchedule> = state
            .schedules
            .values()
            .filter(|s| {
                s.status() == ScheduleStatus::Active
                    && s.deleted_utc.is_none()
                    && s.next_billing_date.is_some_and(|next| next <= as_of)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_billing_date, s.created_utc));
        Ok(due)
    }

    async fn update_schedule_state(
        &self,
        schedule_id: Uuid,
        expected: ScheduleStatus,
        update: &ScheduleUpdate,
    ) -> Result<BillingSchedule, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;
        let schedule = state
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))?;
        if schedule.status() != expected {
            return Err(BillingError::Conflict(format!(
                "schedule {} is {}, expected {}",
                schedule_id,
                schedule.status,
                expected.as_str()
            )));
        }
        update.apply_to(schedule, Utc::now());
        Ok(schedule.clone())
    }

    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        expected_next: NaiveDate,
        advance: &ScheduleAdvance,
    ) -> Result<bool, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;
        let Some(schedule) = state.schedules.get_mut(&schedule_id) else {
            return Ok(false);
        };
        if schedule.status().is_terminal() || schedule.next_billing_date != Some(expected_next) {
            return Ok(false);
        }
        match advance.next_billing_date {
            Some(next) => schedule.next_billing_date = Some(next),
            None => schedule.status = ScheduleStatus::Ended.as_str().to_string(),
        }
        if advance.increment_run_count {
            schedule.run_count += 1;
        }
        schedule.updated_utc = Utc::now();
        Ok(true)
    }

    async fn begin_run(&self, input: &BeginRun) -> Result<BillingRun, BillingError> {
        tokio::task::yield_now().await;
        let run = BillingRun {
            run_id: Uuid::new_v4(),
            schedule_id: input.schedule_id,
            invoice_id: None,
            run_date: input.run_date,
            period_key: input.period_key.clone(),
            run_type: input.run_type.as_str().to_string(),
            status: RunOutcome::Pending.as_str().to_string(),
            error_message: None,
            created_utc: Utc::now(),
            completed_utc: None,
        };
        self.lock()?.runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn find_success_run(
        &self,
        schedule_id: Uuid,
        period_key: &str,
    ) -> Result<Option<BillingRun>, BillingError> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        Ok(state
            .runs
            .values()
            .find(|r| {
                r.schedule_id == schedule_id
                    && r.period_key == period_key
                    && r.outcome() == RunOutcome::Success
            })
            .cloned())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        invoice_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<BillingRun, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;

        if outcome == RunOutcome::Success {
            let run = state
                .runs
                .get(&run_id)
                .ok_or_else(|| BillingError::NotFound(format!("billing run {}", run_id)))?;
            let (schedule_id, period_key) = (run.schedule_id, run.period_key.clone());
            let taken = state.runs.values().any(|r| {
                r.run_id != run_id
                    && r.schedule_id == schedule_id
                    && r.period_key == period_key
                    && r.outcome() == RunOutcome::Success
            });
            if taken {
                return Err(BillingError::DuplicateRun {
                    schedule_id,
                    period_key,
                });
            }
        }

        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BillingError::NotFound(format!("billing run {}", run_id)))?;
        if run.outcome() != RunOutcome::Pending {
            return Err(BillingError::Conflict(format!(
                "billing run {} is already {}",
                run_id, run.status
            )));
        }
        run.status = outcome.as_str().to_string();
        run.invoice_id = invoice_id;
        run.error_message = error_message.map(str::to_string);
        run.completed_utc = Some(Utc::now());
        Ok(run.clone())
    }

    async fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<BillingRun>, BillingError> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        let mut runs: Vec<BillingRun> = state
            .runs
            .values()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(runs)
    }

    async fn create_invoice(
        &self,
        input: &NewInvoice,
        line_items: &[NewLineItem],
        run_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;

        // Validate everything before touching the counter so a rejected unit
        // leaves no trace.
        if !state.entities.contains_key(&input.billing_entity_id) {
            return Err(BillingError::UnknownBillingEntity(input.billing_entity_id));
        }
        if let Some(run_id) = run_id {
            let run = state
                .runs
                .get(&run_id)
                .ok_or_else(|| BillingError::NotFound(format!("billing run {}", run_id)))?;
            if run.outcome() != RunOutcome::Pending {
                return Err(BillingError::Conflict(format!(
                    "billing run {} is already {}",
                    run_id, run.status
                )));
            }
            let (schedule_id, period_key) = (run.schedule_id, run.period_key.clone());
            if state.runs.values().any(|r| {
                r.schedule_id == schedule_id
                    && r.period_key == period_key
                    && r.outcome() == RunOutcome::Success
            }) {
                return Err(BillingError::DuplicateRun {
                    schedule_id,
                    period_key,
                });
            }
        }

        let allocated = match state.entities.get_mut(&input.billing_entity_id) {
            Some(entity) => next_sequence(entity),
            None => return Err(BillingError::UnknownBillingEntity(input.billing_entity_id)),
        };

        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            billing_entity_id: input.billing_entity_id,
            billing_number: format_billing_number(
                &allocated.prefix,
                input.statement_date.year(),
                allocated.sequence,
            ),
            schedule_id: input.schedule_id,
            contract_id: input.contract_id,
            customer_name: input.customer_name.clone(),
            customer_address: input.customer_address.clone(),
            customer_emails: input.customer_emails.clone(),
            customer_tin: input.customer_tin.clone(),
            statement_date: input.statement_date,
            due_date: input.due_date,
            period_start: input.period_start,
            period_end: input.period_end,
            billing_frequency: input.billing_frequency.map(|f| f.as_str().to_string()),
            service_fee: input.service_fee,
            vat_amount: input.vat_amount,
            gross_amount: input.gross_amount,
            withholding_tax: input.withholding_tax,
            net_amount: input.net_amount,
            vat_policy: input.vat_policy.as_str().to_string(),
            has_withholding: input.has_withholding,
            withholding_rate: input.withholding_rate,
            withholding_code: input.withholding_code.clone(),
            status: input.status.as_str().to_string(),
            approved_by: None,
            approved_utc: input.approved_utc,
            rejected_by: None,
            rejected_utc: None,
            rejection_reason: None,
            reschedule_date: None,
            voided_by: None,
            voided_utc: None,
            void_reason: None,
            email_status: EmailStatus::NotSent.as_str().to_string(),
            sent_utc: None,
            email_message_id: None,
            email_error: None,
            paid_utc: None,
            paid_amount: None,
            payment_method: None,
            payment_reference: None,
            follow_up_enabled: input.follow_up_enabled,
            follow_up_count: 0,
            follow_up_level: 0,
            last_follow_up_utc: None,
            created_by: input.created_by,
            created_utc: now,
            updated_utc: now,
        };

        let lines = line_items
            .iter()
            .map(|line| InvoiceLineItem {
                line_item_id: Uuid::new_v4(),
                invoice_id: invoice.invoice_id,
                description: line.description.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                service_fee: line.service_fee,
                vat_amount: line.vat_amount,
                withholding_tax: line.withholding_tax,
                amount: line.amount,
                sort_order: line.sort_order,
                created_utc: now,
            })
            .collect();

        if let Some(run_id) = run_id {
            if let Some(run) = state.runs.get_mut(&run_id) {
                run.status = RunOutcome::Success.as_str().to_string();
                run.invoice_id = Some(invoice.invoice_id);
                run.completed_utc = Some(now);
            }
        }
        state.line_items.insert(invoice.invoice_id, lines);
        state.invoices.insert(invoice.invoice_id, invoice.clone());

        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        tokio::task::yield_now().await;
        Ok(self.lock()?.invoices.get(&invoice_id).cloned())
    }

    async fn get_line_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, BillingError> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        let mut lines = state
            .line_items
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default();
        lines.sort_by_key(|l| l.sort_order);
        Ok(lines)
    }

    async fn list_invoices_for_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<Invoice>, BillingError> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.schedule_id == Some(schedule_id))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.statement_date.cmp(&b.statement_date));
        Ok(invoices)
    }

    async fn update_invoice_state(
        &self,
        invoice_id: Uuid,
        expected: InvoiceStatus,
        update: &InvoiceUpdate,
    ) -> Result<Invoice, BillingError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))?;
        if invoice.status() != expected {
            return Err(BillingError::Conflict(format!(
                "invoice {} is {}, expected {}",
                invoice_id,
                invoice.status,
                expected.as_str()
            )));
        }
        update.apply_to(invoice, Utc::now());
        Ok(invoice.clone())
    }
}
