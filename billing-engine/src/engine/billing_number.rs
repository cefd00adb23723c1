//! Sequential billing numbers: `{prefix}-{year}-{sequence}`.
//!
//! The sequence comes from an atomic per-entity counter in the store. It is
//! never reset (the year segment only reflects the issuance year) and never
//! decremented, so numbers are unique and increasing but may have gaps when an
//! allocation is not followed by a committed invoice.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tracing::instrument;
use uuid::Uuid;

use crate::error::BillingError;
use crate::services::BillingStore;

/// Minimum number of digits in the sequence segment.
pub const SEQUENCE_WIDTH: usize = 5;

pub fn format_billing_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!(
        "{}-{}-{:0width$}",
        prefix,
        year,
        sequence,
        width = SEQUENCE_WIDTH
    )
}

/// Allocates billing numbers outside of invoice insertion (previews, manual
/// numbering). Invoice creation allocates inside the store's own unit of work.
#[derive(Clone)]
pub struct BillingNumberAllocator {
    store: Arc<dyn BillingStore>,
}

impl BillingNumberAllocator {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn allocate(
        &self,
        entity_id: Uuid,
        issued_on: NaiveDate,
    ) -> Result<String, BillingError> {
        let allocated = self.store.allocate_sequence(entity_id).await?;
        Ok(format_billing_number(
            &allocated.prefix,
            issued_on.year(),
            allocated.sequence,
        ))
    }
}
