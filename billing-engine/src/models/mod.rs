//! Domain models for billing-engine.

mod audit;
mod billing_entity;
mod billing_run;
mod invoice;
mod line_item;
mod schedule;

pub use audit::{AuditEvent, AuditEventKind};
pub use billing_entity::{AllocatedSequence, BillingEntity, CreateBillingEntity};
pub use billing_run::{BeginRun, BillingRun, BillingRunType, RunOutcome};
pub use invoice::{
    DeliveryResult, EmailStatus, Invoice, InvoiceStatus, InvoiceUpdate, NewInvoice,
    PaymentDetails,
};
pub use line_item::{InvoiceLineItem, NewLineItem};
pub use schedule::{
    BillingFrequency, BillingSchedule, CreateSchedule, IntervalUnit, ScheduleAdvance,
    ScheduleStatus, ScheduleUpdate, VatPolicy,
};
