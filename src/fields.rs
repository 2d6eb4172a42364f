//! Field normalization: header fields and totals parsed out of non-table
//! blocks. Parsers run in registry order over the blocks in page order;
//! the first match wins and inherits the confidence of the block it came
//! from.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::DateOrder;
use crate::entities::{Amount, BlockOcr, BlockType, Currency};

lazy_static! {
    static ref SUPPLIER_LEADIN: Regex =
        Regex::new(r"(?im)(?:Supplier|Vendor|From):[ \t]*([A-Z][A-Za-z &.,'-]+)").unwrap();
    static ref SUPPLIER_SUFFIX: Regex = Regex::new(
        r"(?m)^[ \t]*([A-Z][A-Za-z &.,'-]*(?:LTD|LIMITED|INC|CORP|LLC|SUPPLIES|SERVICES|PRODUCTS))\.?[ \t]*$"
    )
    .unwrap();
    // Keyword matching is case-insensitive but the captured reference is
    // not: a lowercase run after "Invoice" is prose, not a number.
    static ref INVOICE_NUMBER: Regex =
        Regex::new(r"(?i:Invoice|Inv|Ref)(?i:\s*(?:No|#))?\s*\.?\s*:?\s*([A-Z0-9-]+)").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap();
    static ref NUMERIC_DATE: Regex = Regex::new(r"\b(\d{1,2})[/-](\d{1,2})[/-](\d{2,4})\b").unwrap();
    static ref CURRENCY_CODE: Regex = Regex::new(r"\b(GBP|EUR|USD)\b").unwrap();
    static ref SUBTOTAL: Regex =
        Regex::new(r"(?i)\b(?:sub\s*-?\s*total|net\s+total|net)\b\s*:?\s*[£€$]?\s*([\d,]+\.?\d*)")
            .unwrap();
    static ref TAX: Regex =
        Regex::new(r"(?i)\b(?:vat|tax)\b(?:\s*@?\s*\d+(?:\.\d+)?\s*%)?\s*:?\s*[£€$]?\s*([\d,]+\.?\d*)")
            .unwrap();
    static ref TOTAL: Regex = Regex::new(
        r"(?i)\b(?:grand\s+total|amount\s+due|total\s+due|total)\b\s*:?\s*[£€$]?\s*([\d,]+\.?\d*)"
    )
    .unwrap();
}

/// Optional bias for the parsers; defaults apply when absent.
#[derive(Debug, Clone, Default)]
pub struct FieldContext {
    pub region: Option<String>,
    pub document_class: Option<String>,
    /// Supplier name from a matched template; used when no parser fires.
    pub known_supplier: Option<String>,
    pub date_order: Option<DateOrder>,
}

/// A parsed value plus the confidence of the block it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedField<T> {
    pub value: T,
    pub confidence: f32,
}

impl<T> ExtractedField<T> {
    fn new(value: T, confidence: f32) -> Self {
        Self { value, confidence }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeaderFields {
    pub supplier_name: Option<ExtractedField<String>>,
    pub invoice_number: Option<ExtractedField<String>>,
    pub invoice_date: Option<ExtractedField<NaiveDate>>,
    pub currency: Option<ExtractedField<Currency>>,
    pub subtotal: Option<ExtractedField<Amount>>,
    pub tax_amount: Option<ExtractedField<Amount>>,
    pub total_amount: Option<ExtractedField<Amount>>,
}

/// Run the parser registry over non-table blocks in page order.
pub fn extract_fields<'a>(
    blocks: impl Iterator<Item = &'a BlockOcr>,
    context: &FieldContext,
) -> HeaderFields {
    let mut fields = HeaderFields::default();
    let date_order = context.date_order.unwrap_or(DateOrder::DayFirst);

    let sources: Vec<&BlockOcr> = blocks
        .filter(|b| b.block_type != BlockType::Table && !b.ocr_text.is_empty())
        .collect();

    // Currency first so the amount parsers can normalize to minor units.
    for block in &sources {
        if fields.currency.is_none() {
            if let Some(currency) = parse_currency(&block.ocr_text) {
                fields.currency = Some(ExtractedField::new(currency, block.confidence));
            }
        }
    }
    let currency = fields.currency.as_ref().map(|f| f.value);

    for block in &sources {
        let text = &block.ocr_text;
        let conf = block.confidence;

        if fields.supplier_name.is_none() {
            if let Some(name) = parse_supplier(text) {
                fields.supplier_name = Some(ExtractedField::new(name, conf));
            }
        }
        if fields.invoice_number.is_none() {
            if let Some(number) = parse_invoice_number(text) {
                fields.invoice_number = Some(ExtractedField::new(number, conf));
            }
        }
        if fields.invoice_date.is_none() {
            if let Some(date) = parse_date(text, date_order) {
                fields.invoice_date = Some(ExtractedField::new(date, conf));
            }
        }
        if fields.subtotal.is_none() {
            if let Some(amount) = parse_amount(&SUBTOTAL, text, currency) {
                fields.subtotal = Some(ExtractedField::new(amount, conf));
            }
        }
        if fields.tax_amount.is_none() {
            if let Some(amount) = parse_amount(&TAX, text, currency) {
                fields.tax_amount = Some(ExtractedField::new(amount, conf));
            }
        }
        if fields.total_amount.is_none() {
            if let Some(amount) = parse_total(text, currency) {
                fields.total_amount = Some(ExtractedField::new(amount, conf));
            }
        }
    }

    if fields.supplier_name.is_none() {
        if let Some(known) = &context.known_supplier {
            fields.supplier_name = Some(ExtractedField::new(known.clone(), 0.8));
        }
    }

    fields
}

pub fn parse_supplier(text: &str) -> Option<String> {
    if let Some(caps) = SUPPLIER_LEADIN.captures(text) {
        return Some(trim_name(&caps[1]));
    }
    SUPPLIER_SUFFIX
        .captures(text)
        .map(|caps| trim_name(&caps[1]))
}

fn trim_name(raw: &str) -> String {
    raw.lines().next().unwrap_or(raw).trim().trim_end_matches(['.', ',']).to_owned()
}

pub fn parse_invoice_number(text: &str) -> Option<String> {
    for caps in INVOICE_NUMBER.captures_iter(text) {
        let candidate = &caps[1];
        // A one-letter capture is the regex biting into a longer word
        // ("Invoice Date" -> "D"), not a reference.
        if candidate.len() >= 2 {
            return Some(candidate.to_owned());
        }
    }
    None
}

/// Accepts ISO dates and numeric `a/b/year` forms; ambiguous numeric
/// dates follow the configured order, falling back to the other reading
/// when the preferred one is impossible. Two-digit years map to 2000+.
pub fn parse_date(text: &str, order: DateOrder) -> Option<NaiveDate> {
    if let Some(caps) = ISO_DATE.captures(text) {
        let (y, m, d) = (
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            return Some(date);
        }
    }

    for caps in NUMERIC_DATE.captures_iter(text) {
        let a: u32 = caps[1].parse().ok()?;
        let b: u32 = caps[2].parse().ok()?;
        let mut year: i32 = caps[3].parse().ok()?;
        if caps[3].len() == 2 {
            year += 2000;
        }
        let attempts = match order {
            DateOrder::DayFirst => [(b, a), (a, b)],
            DateOrder::MonthFirst => [(a, b), (b, a)],
        };
        for (month, day) in attempts {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Some(date);
            }
        }
    }
    None
}

pub fn parse_currency(text: &str) -> Option<Currency> {
    for c in text.chars() {
        if let Some(currency) = Currency::from_symbol(c) {
            return Some(currency);
        }
    }
    CURRENCY_CODE
        .captures(text)
        .and_then(|caps| Currency::from_code(&caps[1]))
}

fn parse_amount(pattern: &Regex, text: &str, currency: Option<Currency>) -> Option<Amount> {
    for caps in pattern.captures_iter(text) {
        if let Some(amount) = Amount::from_capture(&caps[1], currency) {
            return Some(amount);
        }
    }
    None
}

/// The total pattern would happily bite into "Net Total"/"Subtotal"
/// matches; skip any hit preceded by a net/sub qualifier.
fn parse_total(text: &str, currency: Option<Currency>) -> Option<Amount> {
    for caps in TOTAL.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let prefix = text[..m.start()].trim_end().to_lowercase();
        if prefix.ends_with("net") || prefix.ends_with("sub") || prefix.ends_with("sub-") {
            continue;
        }
        if let Some(amount) = Amount::from_capture(&caps[1], currency) {
            return Some(amount);
        }
    }
    None
}
