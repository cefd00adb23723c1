//! Audit sink for lifecycle events.
//!
//! Delivery is fire-and-forget: a failing sink is logged and never undoes the
//! transition that produced the event.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::BillingError;
use crate::models::AuditEvent;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), BillingError>;
}

/// Emits each event as a structured log line.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), BillingError> {
        info!(
            event = event.kind.as_str(),
            subject_id = %event.subject_id,
            actor_id = ?event.actor_id,
            detail = ?event.detail,
            occurred_utc = %event.occurred_utc,
            "Audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory. Optionally fails every call, to exercise the
/// fire-and-forget path.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: bool,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), BillingError> {
        if self.failing {
            return Err(BillingError::DeliveryFailure(
                "audit sink unavailable".to_string(),
            ));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Hand an event to the sink, logging instead of propagating any failure.
pub async fn emit(sink: &dyn AuditSink, event: &AuditEvent) {
    if let Err(e) = sink.record(event).await {
        warn!(
            event = event.kind.as_str(),
            subject_id = %event.subject_id,
            error = %e,
            "Audit sink rejected event"
        );
    }
}
