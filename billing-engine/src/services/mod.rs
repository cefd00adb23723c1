//! Services module for billing-engine.

pub mod audit;
pub mod database;
pub mod delivery;
pub mod memory;
pub mod metrics;
pub mod settings;
pub mod store;

pub use audit::{AuditSink, RecordingAuditSink, TracingAuditSink};
pub use database::Database;
pub use delivery::{
    DocumentRenderer, EmailSender, HttpDocumentRenderer, InvoiceMailer, MockEmailSender,
    OutgoingEmail, SmtpEmailSender, StaticDocumentRenderer,
};
pub use memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_billing_run, record_error, record_invoice_created,
    record_invoice_transition, record_schedule_transition,
};
pub use settings::{SettingsCache, SettingsProvider, StaticSettings};
pub use store::BillingStore;
