//! Invoice line item model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Itemized charge on an invoice. `amount` is the line's gross (fee + VAT).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub withholding_tax: Decimal,
    pub amount: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Input for a line item inserted together with its invoice.
#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub withholding_tax: Decimal,
    pub amount: Decimal,
    pub sort_order: i32,
}
