//! The LLM normalizer's response contract. Responses must deserialize
//! against the strict schema; anything non-conforming is discarded and
//! the pipeline proceeds without a merge.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::entities::Currency;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmInvoicePayload {
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub currency: Option<String>,
    pub subtotal: Option<f64>,
    pub tax_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub lines: Vec<LlmLine>,
    pub confidence: f32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmLine {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
    pub tax_rate: Option<f64>,
}

/// The payload after semantic validation: date and currency parsed into
/// their typed forms.
#[derive(Debug, Clone)]
pub struct ValidatedLlm {
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub currency: Option<Currency>,
    pub subtotal: Option<f64>,
    pub tax_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub lines: Vec<LlmLine>,
    pub confidence: f32,
    pub notes: Option<String>,
}

/// Validate a raw response against the contract. `None` means the
/// response is non-conforming and must not be merged.
pub fn validate_response(value: &Value) -> Option<ValidatedLlm> {
    let payload: LlmInvoicePayload = serde_json::from_value(value.clone()).ok()?;

    let invoice_date = match &payload.invoice_date {
        Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?),
        None => None,
    };
    let currency = match &payload.currency {
        Some(code) => Some(Currency::from_code(code)?),
        None => None,
    };
    if !(0.0..=1.0).contains(&payload.confidence) {
        return None;
    }

    Some(ValidatedLlm {
        supplier_name: payload.supplier_name,
        invoice_number: payload.invoice_number,
        invoice_date,
        currency,
        subtotal: payload.subtotal,
        tax_amount: payload.tax_amount,
        total_amount: payload.total_amount,
        lines: payload.lines,
        confidence: payload.confidence,
        notes: payload.notes,
    })
}
