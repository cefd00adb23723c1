//! Run executor integration tests for billing-engine.

mod common;

use billing_engine::engine::{AdHocInvoiceRequest, AdHocLine};
use billing_engine::models::{
    AuditEventKind, BillingFrequency, BillingRunType, EmailStatus, InvoiceStatus, RunOutcome,
    ScheduleStatus, VatPolicy,
};
use billing_engine::services::settings::{DUE_DAYS_KEY, VAT_RATE_KEY, WITHHOLDING_PREFIX};
use billing_engine::services::{BillingStore, MockEmailSender};
use billing_engine::BillingError;
use common::{date, dec, monthly_schedule, TestEngine};

#[tokio::test]
async fn sweep_bills_due_schedule_and_advances() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    assert_eq!(schedule.next_billing_date, Some(date(2025, 1, 15)));

    let summary = engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    let result = &summary.results[0];
    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.period_key.as_deref(), Some("2025-01"));
    assert_eq!(result.billing_number.as_deref(), Some("INV-2025-00001"));
    assert_eq!(result.invoice_status, Some(InvoiceStatus::Pending));

    let invoice = engine.invoice(result.invoice_id.unwrap()).await;
    assert_eq!(invoice.service_fee, dec("1000.00"));
    assert_eq!(invoice.vat_amount, dec("120.00"));
    assert_eq!(invoice.gross_amount, dec("1120.00"));
    assert_eq!(invoice.withholding_tax, dec("0"));
    assert_eq!(invoice.net_amount, dec("1120.00"));
    assert_eq!(invoice.statement_date, date(2025, 1, 15));
    assert_eq!(invoice.due_date, date(2025, 2, 14));
    assert_eq!(invoice.period_start, Some(date(2025, 1, 15)));
    assert_eq!(invoice.period_end, Some(date(2025, 2, 14)));
    assert_eq!(invoice.customer_name, "Globex Corporation");
    assert_eq!(invoice.status(), InvoiceStatus::Pending);

    let lines = engine.store.get_line_items(invoice.invoice_id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].amount, invoice.gross_amount);

    let schedule = engine.schedule(schedule.schedule_id).await;
    assert_eq!(schedule.next_billing_date, Some(date(2025, 2, 15)));
    assert_eq!(schedule.run_count, 1);
    assert_eq!(schedule.status(), ScheduleStatus::Active);

    let runs = engine
        .state
        .executor
        .list_runs(schedule.schedule_id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome(), RunOutcome::Success);
    assert_eq!(runs[0].invoice_id, Some(invoice.invoice_id));
}

#[tokio::test]
async fn schedules_not_yet_due_are_left_alone() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let summary = engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 14))
        .await
        .unwrap();

    assert!(summary.results.is_empty());
    assert!(engine.invoices_for(schedule.schedule_id).await.is_empty());
}

#[tokio::test]
async fn second_sweep_on_same_day_bills_nothing() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    let executor = &engine.state.executor;

    executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    let second = executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();

    assert!(second.results.is_empty());
    assert_eq!(engine.invoices_for(schedule.schedule_id).await.len(), 1);
}

#[tokio::test]
async fn stale_schedule_snapshot_is_skipped_not_billed_twice() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let stale = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    let executor = &engine.state.executor;

    executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    let result = executor
        .execute_schedule(&stale, BillingRunType::Scheduled)
        .await;

    assert_eq!(result.outcome, RunOutcome::Skipped);
    assert_eq!(engine.invoices_for(stale.schedule_id).await.len(), 1);

    let schedule = engine.schedule(stale.schedule_id).await;
    assert_eq!(schedule.next_billing_date, Some(date(2025, 2, 15)));
    assert_eq!(schedule.run_count, 1);

    let outcomes: Vec<RunOutcome> = executor
        .list_runs(stale.schedule_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.outcome())
        .collect();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.contains(&RunOutcome::Skipped));
    assert!(outcomes.contains(&RunOutcome::Success));
}

#[tokio::test]
async fn overlapping_sweeps_bill_each_period_once() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut schedule_ids = Vec::new();
    for _ in 0..3 {
        let schedule = engine
            .active_schedule(monthly_schedule(entity.entity_id))
            .await;
        schedule_ids.push(schedule.schedule_id);
    }
    let executor = &engine.state.executor;

    let (first, second) = tokio::join!(
        executor.execute_due_runs(date(2025, 1, 15)),
        executor.execute_due_runs(date(2025, 1, 15)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.succeeded + second.succeeded, 3);
    assert_eq!(first.failed + second.failed, 0);
    for schedule_id in &schedule_ids {
        assert_eq!(engine.invoices_for(*schedule_id).await.len(), 1);
        let schedule = engine.schedule(*schedule_id).await;
        assert_eq!(schedule.next_billing_date, Some(date(2025, 2, 15)));
        assert_eq!(schedule.run_count, 1);
    }

    let mut numbers: Vec<String> = engine
        .store
        .all_invoices()
        .unwrap()
        .into_iter()
        .map(|i| i.billing_number)
        .collect();
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 3);
}

#[tokio::test]
async fn failed_run_does_not_advance_and_is_retried() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.has_withholding = true;
    input.withholding_code = Some("ZZ999".to_string());
    let schedule = engine.active_schedule(input).await;
    let executor = &engine.state.executor;

    let summary = executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    assert_eq!(summary.failed, 1);
    let failed = &summary.results[0];
    assert_eq!(failed.outcome, RunOutcome::Failed);
    assert!(failed.error.as_deref().unwrap().contains("ZZ999"));

    let unchanged = engine.schedule(schedule.schedule_id).await;
    assert_eq!(unchanged.next_billing_date, Some(date(2025, 1, 15)));
    assert_eq!(unchanged.run_count, 0);
    assert!(engine.invoices_for(schedule.schedule_id).await.is_empty());

    engine
        .settings
        .set(&format!("{}ZZ999", WITHHOLDING_PREFIX), "0.05");
    let retry = executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    assert_eq!(retry.succeeded, 1);

    let invoices = engine.invoices_for(schedule.schedule_id).await;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].withholding_tax, dec("50.00"));
    assert_eq!(invoices[0].billing_number, "INV-2025-00001");

    let runs = executor.list_runs(schedule.schedule_id).await.unwrap();
    assert_eq!(runs.len(), 2);
    let failed_run = runs
        .iter()
        .find(|r| r.outcome() == RunOutcome::Failed)
        .unwrap();
    assert!(failed_run.invoice_id.is_none());
    assert!(failed_run.error_message.is_some());
}

#[tokio::test]
async fn failing_schedule_does_not_block_the_others() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut broken = monthly_schedule(entity.entity_id);
    broken.has_withholding = true;
    broken.withholding_code = Some("ZZ999".to_string());
    let broken = engine.active_schedule(broken).await;
    let healthy = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let summary = engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    let outcome_of = |id: uuid::Uuid| {
        summary
            .results
            .iter()
            .find(|r| r.schedule_id == id)
            .map(|r| r.outcome)
            .unwrap()
    };
    assert_eq!(outcome_of(broken.schedule_id), RunOutcome::Failed);
    assert_eq!(outcome_of(healthy.schedule_id), RunOutcome::Success);

    let advanced = engine.schedule(healthy.schedule_id).await;
    assert_eq!(advanced.next_billing_date, Some(date(2025, 2, 15)));
    assert_eq!(engine.invoices_for(healthy.schedule_id).await.len(), 1);

    let held = engine.schedule(broken.schedule_id).await;
    assert_eq!(held.next_billing_date, Some(date(2025, 1, 15)));
    assert!(engine.invoices_for(broken.schedule_id).await.is_empty());
}

#[tokio::test]
async fn out_of_range_due_days_setting_uses_default_term() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let first = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    let executor = &engine.state.executor;

    engine.settings.set(DUE_DAYS_KEY, "200000000000000");
    let summary = executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    let invoice = &engine.invoices_for(first.schedule_id).await[0];
    assert_eq!(invoice.due_date, date(2025, 2, 14));

    engine.settings.set(DUE_DAYS_KEY, "100000000");
    let summary = executor.execute_due_runs(date(2025, 2, 15)).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    let invoices = engine.invoices_for(first.schedule_id).await;
    let february = invoices
        .iter()
        .find(|i| i.statement_date == date(2025, 2, 15))
        .unwrap();
    assert_eq!(february.due_date, date(2025, 3, 17));
}

#[tokio::test]
async fn withholding_code_resolves_builtin_preset() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.has_withholding = true;
    input.withholding_code = Some("wc160".to_string());
    let schedule = engine.active_schedule(input).await;

    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.withholding_rate, Some(dec("0.02")));
    assert_eq!(invoice.withholding_tax, dec("20.00"));
    assert_eq!(invoice.net_amount, dec("1100.00"));
}

#[tokio::test]
async fn vat_rate_comes_from_settings() {
    let engine = TestEngine::new();
    engine.settings.set(VAT_RATE_KEY, "0.10");
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.vat_amount, dec("100.00"));
    assert_eq!(invoice.gross_amount, dec("1100.00"));
}

#[tokio::test]
async fn monthly_schedule_with_automation_is_approved_and_sent() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.auto_approve = true;
    input.auto_send_enabled = true;
    let schedule = engine.active_schedule(input).await;

    let summary = engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();
    assert_eq!(summary.results[0].invoice_status, Some(InvoiceStatus::Sent));

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.status(), InvoiceStatus::Sent);
    assert_eq!(invoice.email_status(), EmailStatus::Sent);
    assert!(invoice.approved_utc.is_some());
    assert!(invoice.sent_utc.is_some());

    assert_eq!(engine.sender.send_count(), 1);
    let email = &engine.sender.sent()[0];
    assert_eq!(email.subject, "Invoice INV-2025-00001");
    assert_eq!(email.to, vec!["ap@globex.test".to_string()]);

    let kinds: Vec<AuditEventKind> = engine.audit.events().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditEventKind::InvoiceApproved));
    assert!(kinds.contains(&AuditEventKind::InvoiceSent));
}

#[tokio::test]
async fn annual_schedule_is_auto_approved_but_not_sent() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.frequency = BillingFrequency::Annually;
    input.auto_approve = true;
    input.auto_send_enabled = true;
    let schedule = engine.active_schedule(input).await;

    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.status(), InvoiceStatus::Approved);
    assert_eq!(invoice.email_status(), EmailStatus::NotSent);
    assert_eq!(engine.sender.send_count(), 0);

    let schedule = engine.schedule(schedule.schedule_id).await;
    assert_eq!(schedule.next_billing_date, Some(date(2026, 1, 15)));
}

#[tokio::test]
async fn auto_send_without_auto_approve_stays_pending() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.auto_send_enabled = true;
    let schedule = engine.active_schedule(input).await;

    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.status(), InvoiceStatus::Pending);
    assert_eq!(engine.sender.send_count(), 0);
}

#[tokio::test]
async fn delivery_failure_leaves_invoice_approved_and_run_successful() {
    let engine = TestEngine::with_sender(MockEmailSender::failing("smtp unavailable"));
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.auto_approve = true;
    input.auto_send_enabled = true;
    let schedule = engine.active_schedule(input).await;

    let summary = engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.results[0].invoice_status, Some(InvoiceStatus::Approved));

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.status(), InvoiceStatus::Approved);
    assert_eq!(invoice.email_status(), EmailStatus::Failed);
    assert_eq!(invoice.email_error.as_deref(), Some("smtp unavailable"));

    let schedule = engine.schedule(schedule.schedule_id).await;
    assert_eq!(schedule.next_billing_date, Some(date(2025, 2, 15)));
}

#[tokio::test]
async fn schedule_ends_when_date_range_is_exhausted() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.end_date = Some(date(2025, 2, 20));
    let schedule = engine.active_schedule(input).await;
    let executor = &engine.state.executor;

    executor.execute_due_runs(date(2025, 1, 15)).await.unwrap();
    executor.execute_due_runs(date(2025, 2, 15)).await.unwrap();

    let schedule = engine.schedule(schedule.schedule_id).await;
    assert_eq!(schedule.status(), ScheduleStatus::Ended);
    assert_eq!(schedule.run_count, 2);

    let invoices = engine.invoices_for(schedule.schedule_id).await;
    assert_eq!(invoices.len(), 2);
    assert_eq!(invoices[1].period_end, Some(date(2025, 2, 20)));

    let ended = engine
        .audit
        .events()
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::ScheduleEnded)
        .count();
    assert_eq!(ended, 1);

    let later = executor.execute_due_runs(date(2025, 3, 15)).await.unwrap();
    assert!(later.results.is_empty());
}

#[tokio::test]
async fn overdue_schedule_catches_up_one_period_per_sweep() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    let executor = &engine.state.executor;

    executor.execute_due_runs(date(2025, 3, 20)).await.unwrap();
    assert_eq!(
        engine.schedule(schedule.schedule_id).await.next_billing_date,
        Some(date(2025, 2, 15))
    );

    executor.execute_due_runs(date(2025, 3, 20)).await.unwrap();
    executor.execute_due_runs(date(2025, 3, 20)).await.unwrap();

    let invoices = engine.invoices_for(schedule.schedule_id).await;
    let statements: Vec<_> = invoices.iter().map(|i| i.statement_date).collect();
    assert_eq!(
        statements,
        vec![date(2025, 1, 15), date(2025, 2, 15), date(2025, 3, 15)]
    );
    assert_eq!(
        engine.schedule(schedule.schedule_id).await.next_billing_date,
        Some(date(2025, 4, 15))
    );
}

#[tokio::test]
async fn run_now_bills_current_occurrence() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let result = engine
        .state
        .executor
        .run_now(schedule.schedule_id)
        .await
        .unwrap();

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.run_date, Some(date(2025, 1, 15)));

    let runs = engine
        .state
        .executor
        .list_runs(schedule.schedule_id)
        .await
        .unwrap();
    assert_eq!(runs[0].run_type, BillingRunType::Manual.as_str());
}

#[tokio::test]
async fn run_now_requires_active_schedule() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;
    engine
        .state
        .schedules
        .pause(schedule.schedule_id, None)
        .await
        .unwrap();

    let result = engine.state.executor.run_now(schedule.schedule_id).await;
    assert!(matches!(
        result,
        Err(BillingError::InvalidTransition { action: "run", .. })
    ));

    let missing = engine.state.executor.run_now(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(BillingError::NotFound(_))));
}

fn adhoc_request(entity_id: uuid::Uuid) -> AdHocInvoiceRequest {
    AdHocInvoiceRequest {
        billing_entity_id: entity_id,
        contract_id: None,
        customer_name: "Initech".to_string(),
        customer_address: None,
        customer_emails: vec!["billing@initech.test".to_string()],
        customer_tin: None,
        statement_date: date(2025, 3, 3),
        due_date: None,
        amount_is_vat_inclusive: false,
        vat_policy: VatPolicy::Vat,
        has_withholding: false,
        withholding_rate: None,
        withholding_code: None,
        lines: vec![
            AdHocLine {
                description: "Implementation".to_string(),
                quantity: dec("2"),
                unit_price: dec("250.00"),
            },
            AdHocLine {
                description: "Training".to_string(),
                quantity: dec("1"),
                unit_price: dec("333.33"),
            },
        ],
        billing_frequency: None,
        auto_approve: true,
        auto_send_enabled: true,
        created_by: Some(common::actor()),
    }
}

#[tokio::test]
async fn adhoc_invoice_sums_per_line_taxes_and_is_never_auto_sent() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("ADH").await;

    let invoice = engine
        .state
        .executor
        .generate_adhoc(&adhoc_request(entity.entity_id))
        .await
        .unwrap();

    // 500.00 @12% = 60.00; 333.33 @12% = 40.00 (39.9996)
    assert_eq!(invoice.service_fee, dec("833.33"));
    assert_eq!(invoice.vat_amount, dec("100.00"));
    assert_eq!(invoice.gross_amount, dec("933.33"));
    assert_eq!(invoice.due_date, date(2025, 4, 2));
    assert_eq!(invoice.billing_number, "ADH-2025-00001");
    assert_eq!(invoice.status(), InvoiceStatus::Approved);
    assert_eq!(engine.sender.send_count(), 0);

    let lines = engine.store.get_line_items(invoice.invoice_id).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].sort_order, 0);
    assert_eq!(lines[1].description, "Training");
}

#[tokio::test]
async fn adhoc_invoice_with_monthly_frequency_is_sent() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("ADH").await;
    let mut request = adhoc_request(entity.entity_id);
    request.billing_frequency = Some(BillingFrequency::Monthly);

    let invoice = engine
        .state
        .executor
        .generate_adhoc(&request)
        .await
        .unwrap();

    assert_eq!(invoice.status(), InvoiceStatus::Sent);
    assert_eq!(engine.sender.send_count(), 1);
}

#[tokio::test]
async fn adhoc_invoice_rejects_empty_or_invalid_lines() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("ADH").await;

    let mut request = adhoc_request(entity.entity_id);
    request.lines.clear();
    assert!(matches!(
        engine.state.executor.generate_adhoc(&request).await,
        Err(BillingError::InvalidAmount(_))
    ));

    let mut request = adhoc_request(entity.entity_id);
    request.lines[0].quantity = dec("0");
    assert!(matches!(
        engine.state.executor.generate_adhoc(&request).await,
        Err(BillingError::InvalidAmount(_))
    ));

    let mut request = adhoc_request(uuid::Uuid::new_v4());
    request.auto_approve = false;
    assert!(matches!(
        engine.state.executor.generate_adhoc(&request).await,
        Err(BillingError::UnknownBillingEntity(_))
    ));
}

#[tokio::test]
async fn due_day_of_month_sets_due_date() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.due_day_of_month = Some(5);
    let schedule = engine.active_schedule(input).await;

    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();

    let invoice = &engine.invoices_for(schedule.schedule_id).await[0];
    assert_eq!(invoice.due_date, date(2025, 2, 5));
}
