//! Persistence contract for the billing engine.
//!
//! Every write that guards an invariant is a single conditional operation in
//! the store, never a read followed by a write in the engine:
//!
//! - `allocate_sequence` and `create_invoice` increment the entity counter
//!   atomically.
//! - `create_invoice` with a linked run marks that run SUCCESS in the same
//!   unit of work; a second SUCCESS for the same schedule and period fails
//!   with [`BillingError::DuplicateRun`] and rolls everything back.
//! - `update_*_state` only apply when the row is still in the expected status.
//! - `advance_schedule` only applies when `next_billing_date` still holds the
//!   expected value.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    AllocatedSequence, BeginRun, BillingEntity, BillingRun, BillingSchedule, CreateBillingEntity,
    CreateSchedule, Invoice, InvoiceLineItem, InvoiceStatus, InvoiceUpdate, NewInvoice,
    NewLineItem, RunOutcome, ScheduleAdvance, ScheduleStatus, ScheduleUpdate,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), BillingError>;

    // Billing entities

    async fn insert_billing_entity(
        &self,
        input: &CreateBillingEntity,
    ) -> Result<BillingEntity, BillingError>;

    async fn get_billing_entity(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<BillingEntity>, BillingError>;

    /// Hand out the entity's next sequence and increment its counter.
    async fn allocate_sequence(&self, entity_id: Uuid) -> Result<AllocatedSequence, BillingError>;

    // Schedules

    async fn insert_schedule(&self, input: &CreateSchedule)
        -> Result<BillingSchedule, BillingError>;

    async fn get_schedule(&self, schedule_id: Uuid)
        -> Result<Option<BillingSchedule>, BillingError>;

    /// ACTIVE, not deleted, `next_billing_date <= as_of`, oldest first.
    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<BillingSchedule>, BillingError>;

    /// Apply a lifecycle patch if the schedule is still in `expected`.
    /// Fails with `Conflict` when it is not.
    async fn update_schedule_state(
        &self,
        schedule_id: Uuid,
        expected: ScheduleStatus,
        update: &ScheduleUpdate,
    ) -> Result<BillingSchedule, BillingError>;

    /// Move the schedule past `expected_next`. Ends the schedule when
    /// `advance.next_billing_date` is `None`. Returns `false` when another
    /// writer already moved it.
    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        expected_next: NaiveDate,
        advance: &ScheduleAdvance,
    ) -> Result<bool, BillingError>;

    // Runs

    /// Open a PENDING run.
    async fn begin_run(&self, input: &BeginRun) -> Result<BillingRun, BillingError>;

    async fn find_success_run(
        &self,
        schedule_id: Uuid,
        period_key: &str,
    ) -> Result<Option<BillingRun>, BillingError>;

    /// Close a PENDING run with its outcome.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        invoice_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<BillingRun, BillingError>;

    /// Runs of a schedule, newest first.
    async fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<BillingRun>, BillingError>;

    // Invoices

    /// Allocate the billing number, insert the invoice and its lines and, when
    /// `run_id` is set, mark that run SUCCESS. All or nothing.
    async fn create_invoice(
        &self,
        invoice: &NewInvoice,
        line_items: &[NewLineItem],
        run_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError>;

    async fn get_line_items(&self, invoice_id: Uuid)
        -> Result<Vec<InvoiceLineItem>, BillingError>;

    async fn list_invoices_for_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<Invoice>, BillingError>;

    /// Apply a lifecycle patch if the invoice is still in `expected`.
    /// Fails with `Conflict` when it is not.
    async fn update_invoice_state(
        &self,
        invoice_id: Uuid,
        expected: InvoiceStatus,
        update: &InvoiceUpdate,
    ) -> Result<Invoice, BillingError>;
}
