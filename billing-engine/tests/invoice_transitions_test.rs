//! Invoice lifecycle integration tests for billing-engine.

mod common;

use billing_engine::models::{
    AuditEventKind, EmailStatus, Invoice, InvoiceStatus, PaymentDetails,
};
use billing_engine::services::settings::FOLLOW_UP_MAX_LEVEL_KEY;
use billing_engine::services::{MockEmailSender, RecordingAuditSink};
use billing_engine::BillingError;
use common::{actor, date, dec, monthly_schedule, TestEngine};

/// Bill the January occurrence of a fresh monthly schedule.
async fn pending_invoice(engine: &TestEngine) -> Invoice {
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
    engine.invoices_for(schedule.schedule_id).await.remove(0)
}

fn payment(amount: &str) -> PaymentDetails {
    PaymentDetails {
        amount: dec(amount),
        method: "bank_transfer".to_string(),
        reference: Some("TRX-0042".to_string()),
        paid_at: None,
    }
}

#[tokio::test]
async fn invoice_goes_from_pending_to_paid() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;

    let approved = transitions
        .approve(invoice.invoice_id, Some(actor()))
        .await
        .unwrap();
    assert_eq!(approved.status(), InvoiceStatus::Approved);
    assert_eq!(approved.approved_by, Some(actor()));
    assert!(approved.approved_utc.is_some());

    let sent = transitions.send(invoice.invoice_id).await.unwrap();
    assert_eq!(sent.status(), InvoiceStatus::Sent);
    assert_eq!(sent.email_status(), EmailStatus::Sent);
    assert_eq!(sent.email_message_id.as_deref(), Some("mock-email-1"));

    let paid = transitions
        .mark_paid(invoice.invoice_id, &payment("1120.00"))
        .await
        .unwrap();
    assert_eq!(paid.status(), InvoiceStatus::Paid);
    assert_eq!(paid.paid_amount, Some(dec("1120.00")));
    assert_eq!(paid.payment_reference.as_deref(), Some("TRX-0042"));
    assert!(paid.paid_utc.is_some());

    let kinds: Vec<AuditEventKind> = engine
        .audit
        .events()
        .iter()
        .filter(|e| e.subject_id == invoice.invoice_id)
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::InvoiceApproved,
            AuditEventKind::InvoiceSent,
            AuditEventKind::InvoicePaid,
        ]
    );
}

#[tokio::test]
async fn paid_invoice_is_terminal() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;
    transitions.approve(invoice.invoice_id, None).await.unwrap();
    transitions.send(invoice.invoice_id).await.unwrap();
    transitions
        .mark_paid(invoice.invoice_id, &payment("1120.00"))
        .await
        .unwrap();

    let result = transitions.void(invoice.invoice_id, actor(), "duplicate").await;
    assert!(matches!(
        result,
        Err(BillingError::InvalidTransition { from: "PAID", .. })
    ));
}

#[tokio::test]
async fn pending_invoice_cannot_be_sent_or_paid() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;

    assert!(matches!(
        transitions.send(invoice.invoice_id).await,
        Err(BillingError::InvalidTransition { .. })
    ));
    assert!(matches!(
        transitions
            .mark_paid(invoice.invoice_id, &payment("1120.00"))
            .await,
        Err(BillingError::InvalidTransition { .. })
    ));
    assert_eq!(engine.sender.send_count(), 0);
    assert_eq!(
        engine.invoice(invoice.invoice_id).await.status(),
        InvoiceStatus::Pending
    );
}

#[tokio::test]
async fn reject_requires_reason() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;

    let result = transitions
        .reject(invoice.invoice_id, actor(), "   ", None)
        .await;
    assert!(matches!(result, Err(BillingError::MissingReason(_))));
    assert_eq!(
        engine.invoice(invoice.invoice_id).await.status(),
        InvoiceStatus::Pending
    );

    let rejected = transitions
        .reject(
            invoice.invoice_id,
            actor(),
            "wrong amount",
            Some(date(2025, 2, 1)),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), InvoiceStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("wrong amount"));
    assert_eq!(rejected.reschedule_date, Some(date(2025, 2, 1)));
    assert_eq!(rejected.rejected_by, Some(actor()));

    let event = engine
        .audit
        .events()
        .into_iter()
        .find(|e| e.kind == AuditEventKind::InvoiceRejected)
        .unwrap();
    assert_eq!(event.detail.as_deref(), Some("wrong amount"));
}

#[tokio::test]
async fn sent_invoice_can_be_voided() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;
    transitions.approve(invoice.invoice_id, None).await.unwrap();
    transitions.send(invoice.invoice_id).await.unwrap();

    assert!(matches!(
        transitions.void(invoice.invoice_id, actor(), "").await,
        Err(BillingError::MissingReason(_))
    ));

    let voided = transitions
        .void(invoice.invoice_id, actor(), "contract cancelled")
        .await
        .unwrap();
    assert_eq!(voided.status(), InvoiceStatus::Void);
    assert_eq!(voided.void_reason.as_deref(), Some("contract cancelled"));
    assert_eq!(voided.voided_by, Some(actor()));
}

#[tokio::test]
async fn failed_delivery_is_recorded_and_can_be_retried() {
    let engine = TestEngine::with_sender(MockEmailSender::failing("mailbox full"));
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;
    transitions.approve(invoice.invoice_id, None).await.unwrap();

    let result = transitions.send(invoice.invoice_id).await;
    assert!(matches!(result, Err(BillingError::DeliveryFailure(ref e)) if e == "mailbox full"));

    let stored = engine.invoice(invoice.invoice_id).await;
    assert_eq!(stored.status(), InvoiceStatus::Approved);
    assert_eq!(stored.email_status(), EmailStatus::Failed);
    assert_eq!(stored.email_error.as_deref(), Some("mailbox full"));
    assert!(stored.sent_utc.is_none());

    // Still approved, so a second attempt is allowed.
    assert!(matches!(
        transitions.send(invoice.invoice_id).await,
        Err(BillingError::DeliveryFailure(_))
    ));

    engine.sender.recover();
    let sent = transitions.send(invoice.invoice_id).await.unwrap();
    assert_eq!(sent.status(), InvoiceStatus::Sent);
    assert_eq!(sent.email_status(), EmailStatus::Sent);
    assert!(sent.email_error.is_none());
    assert!(engine.invoice(invoice.invoice_id).await.email_error.is_none());
}

#[tokio::test]
async fn invoice_without_recipient_is_not_sent() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let mut input = monthly_schedule(entity.entity_id);
    input.customer_emails.clear();
    let schedule = engine.active_schedule(input).await;
    engine
        .state
        .executor
        .execute_due_runs(date(2025, 1, 15))
        .await
        .unwrap();
    let invoice = engine.invoices_for(schedule.schedule_id).await.remove(0);
    let transitions = &engine.state.invoices;
    transitions.approve(invoice.invoice_id, None).await.unwrap();

    assert!(matches!(
        transitions.send(invoice.invoice_id).await,
        Err(BillingError::DeliveryFailure(_))
    ));
    assert_eq!(engine.sender.send_count(), 0);
    assert_eq!(
        engine.invoice(invoice.invoice_id).await.email_status(),
        EmailStatus::Failed
    );
}

#[tokio::test]
async fn follow_up_level_is_capped_by_setting() {
    let engine = TestEngine::new();
    engine.settings.set(FOLLOW_UP_MAX_LEVEL_KEY, "2");
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;
    transitions.approve(invoice.invoice_id, None).await.unwrap();

    assert!(matches!(
        transitions.record_follow_up(invoice.invoice_id).await,
        Err(BillingError::InvalidTransition { .. })
    ));

    transitions.send(invoice.invoice_id).await.unwrap();
    let mut last = None;
    for _ in 0..3 {
        last = Some(
            transitions
                .record_follow_up(invoice.invoice_id)
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();
    assert_eq!(last.follow_up_count, 3);
    assert_eq!(last.follow_up_level, 2);
    assert_eq!(last.status(), InvoiceStatus::Sent);
    assert!(last.last_follow_up_utc.is_some());
}

#[tokio::test]
async fn concurrent_approvals_commit_once() {
    let engine = TestEngine::new();
    let invoice = pending_invoice(&engine).await;
    let transitions = &engine.state.invoices;

    let (first, second) = tokio::join!(
        transitions.approve(invoice.invoice_id, Some(actor())),
        transitions.approve(invoice.invoice_id, None),
    );

    let results = [first, second];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let conflicted = results
        .iter()
        .filter(|r| matches!(r, Err(BillingError::Conflict(_))))
        .count();
    assert_eq!(committed, 1);
    assert_eq!(conflicted, 1);

    let approvals = engine
        .audit
        .events()
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::InvoiceApproved)
        .count();
    assert_eq!(approvals, 1);
}

#[tokio::test]
async fn failing_audit_sink_does_not_block_transitions() {
    let engine = TestEngine::with_audit(RecordingAuditSink::failing());
    let invoice = pending_invoice(&engine).await;

    let approved = engine
        .state
        .invoices
        .approve(invoice.invoice_id, Some(actor()))
        .await
        .unwrap();

    assert_eq!(approved.status(), InvoiceStatus::Approved);
    assert!(engine.audit.events().is_empty());
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let engine = TestEngine::new();
    let result = engine
        .state
        .invoices
        .approve(uuid::Uuid::new_v4(), None)
        .await;
    assert!(matches!(result, Err(BillingError::NotFound(_))));
}
