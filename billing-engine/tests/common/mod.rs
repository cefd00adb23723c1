//! Test helper module for billing-engine integration tests.
//!
//! Builds the engine on the in-memory store with recording collaborators.

#![allow(dead_code)]

use billing_engine::models::{
    BillingEntity, BillingFrequency, BillingSchedule, CreateBillingEntity, CreateSchedule,
    Invoice, VatPolicy,
};
use billing_engine::services::{
    init_metrics, BillingStore, InMemoryStore, InvoiceMailer, MockEmailSender,
    RecordingAuditSink, SettingsCache, StaticSettings,
};
use billing_engine::startup::AppState;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_ACTOR_ID: &str = "11111111-1111-1111-1111-111111111111";

pub fn actor() -> Uuid {
    Uuid::parse_str(TEST_ACTOR_ID).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Engine wired on the in-memory store.
pub struct TestEngine {
    pub store: Arc<InMemoryStore>,
    pub settings: Arc<StaticSettings>,
    pub sender: Arc<MockEmailSender>,
    pub audit: Arc<RecordingAuditSink>,
    pub state: AppState,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::build(MockEmailSender::new(), RecordingAuditSink::new())
    }

    pub fn with_sender(sender: MockEmailSender) -> Self {
        Self::build(sender, RecordingAuditSink::new())
    }

    pub fn with_audit(audit: RecordingAuditSink) -> Self {
        Self::build(MockEmailSender::new(), audit)
    }

    fn build(sender: MockEmailSender, audit: RecordingAuditSink) -> Self {
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let settings = Arc::new(StaticSettings::new());
        let sender = Arc::new(sender);
        let audit = Arc::new(audit);

        // Zero TTL: settings changed mid-test are seen by the next read.
        let cache = Arc::new(SettingsCache::new(settings.clone(), Duration::ZERO));
        let state = AppState::assemble(
            store.clone(),
            cache,
            InvoiceMailer::new(sender.clone(), None),
            audit.clone(),
        );

        Self {
            store,
            settings,
            sender,
            audit,
            state,
        }
    }

    pub async fn create_entity(&self, prefix: &str) -> BillingEntity {
        self.store
            .insert_billing_entity(&CreateBillingEntity {
                name: format!("{} Holdings", prefix),
                invoice_prefix: prefix.to_string(),
                tin: Some("000-123-456-000".to_string()),
            })
            .await
            .expect("Failed to create billing entity")
    }

    /// Create and approve a schedule.
    pub async fn active_schedule(&self, input: CreateSchedule) -> BillingSchedule {
        let schedule = self
            .state
            .schedules
            .create(&input)
            .await
            .expect("Failed to create schedule");
        self.state
            .schedules
            .approve(schedule.schedule_id, actor())
            .await
            .expect("Failed to approve schedule")
    }

    pub async fn schedule(&self, schedule_id: Uuid) -> BillingSchedule {
        self.store
            .get_schedule(schedule_id)
            .await
            .unwrap()
            .expect("schedule exists")
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Invoice {
        self.store
            .get_invoice(invoice_id)
            .await
            .unwrap()
            .expect("invoice exists")
    }

    pub async fn invoices_for(&self, schedule_id: Uuid) -> Vec<Invoice> {
        self.store
            .list_invoices_for_schedule(schedule_id)
            .await
            .unwrap()
    }
}

/// Monthly schedule on the 15th from 2025-01-15: 1,000.00 VAT-exclusive,
/// no withholding, no automation.
pub fn monthly_schedule(entity_id: Uuid) -> CreateSchedule {
    CreateSchedule {
        contract_id: Uuid::new_v4(),
        billing_entity_id: entity_id,
        customer_name: "Globex Corporation".to_string(),
        customer_address: Some("1 Globex Way".to_string()),
        customer_emails: vec!["ap@globex.test".to_string()],
        customer_tin: Some("111-222-333-000".to_string()),
        description: "Monthly retainer".to_string(),
        billing_amount: dec("1000.00"),
        amount_is_vat_inclusive: false,
        vat_policy: VatPolicy::Vat,
        has_withholding: false,
        withholding_rate: None,
        withholding_code: None,
        frequency: BillingFrequency::Monthly,
        custom_interval_value: None,
        custom_interval_unit: None,
        billing_day_of_month: 15,
        due_day_of_month: None,
        start_date: date(2025, 1, 15),
        end_date: None,
        auto_approve: false,
        auto_send_enabled: false,
        created_by: Some(actor()),
    }
}
