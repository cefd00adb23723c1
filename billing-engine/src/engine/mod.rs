//! Billing engine: pure tax, recurrence and lifecycle rules, plus the
//! services that apply them against a store.

pub mod billing_number;
pub mod executor;
pub mod invoice_lifecycle;
pub mod recurrence;
pub mod schedule_lifecycle;
pub mod tax;
pub mod transitions;

pub use billing_number::{format_billing_number, BillingNumberAllocator};
pub use executor::{AdHocInvoiceRequest, AdHocLine, RunExecutor, ScheduleRunResult, SweepSummary};
pub use invoice_lifecycle::{AutomationFlags, CreationPlan, InvoiceTransition, AUTO_SEND_FREQUENCIES};
pub use recurrence::{Cadence, RecurrenceRule};
pub use schedule_lifecycle::ScheduleTransition;
pub use tax::{AmountBasis, TaxBreakdown, TaxInput, STANDARD_VAT_RATE};
pub use transitions::{InvoiceTransitions, ScheduleTransitions};
