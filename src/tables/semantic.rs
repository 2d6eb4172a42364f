//! Semantic table reconstruction: row-pattern extraction over the raw
//! OCR text of a block. Runs in parallel with the geometric path and wins
//! when word geometry is poor or missing.

use lazy_static::lazy_static;
use regex::Regex;

use crate::entities::{Amount, Currency, LineItem, Provenance};

lazy_static! {
    /// `DESCRIPTION QTY x UNIT TOTAL`
    static ref QTY_X_PATTERN: Regex = Regex::new(
        r"(?i)^(.+?)\s+(\d+(?:\.\d+)?)\s*x\s*[£$€]?\s*(\d+(?:,\d+)*(?:\.\d{2})?)\s*[£$€]?\s*(\d+(?:,\d+)*(?:\.\d{2})?)"
    )
    .unwrap();
    /// `DESCRIPTION UNIT each QTY units TOTAL`
    static ref EACH_PATTERN: Regex = Regex::new(
        r"(?i)^(.+?)\s+[£$€]?\s*(\d+(?:,\d+)*(?:\.\d{2})?)\s+each\s+(\d+(?:\.\d+)?)\s+units\s+[£$€]?\s*(\d+(?:,\d+)*(?:\.\d{2})?)"
    )
    .unwrap();
    static ref PRICE_TOKEN: Regex =
        Regex::new(r"[£$€]?\s*(\d+(?:,\d+)*(?:\.\d{2})?)").unwrap();
    static ref PRICE_IN_LINE: Regex = Regex::new(r"[£$€]\d+\.\d{2}|\d+\.\d{2}").unwrap();
    static ref MULTI_SPACE: Regex = Regex::new(r"\s{2,}").unwrap();
    static ref QTY_TOKEN: Regex = Regex::new(r"^\d+(?:\.\d+)?$").unwrap();
}

const SECTION_START_KEYWORDS: [&str; 12] = [
    "description",
    "item",
    "product",
    "service",
    "qty",
    "quantity",
    "unit price",
    "price",
    "amount",
    "total",
    "line",
    "details",
];

/// Filler lines end the line-item region.
const SECTION_END_KEYWORDS: [&str; 8] = [
    "subtotal", "vat", "tax", "total", "amount due", "balance", "payment", "terms",
];

/// Extract line items from the concatenated text of a block.
pub fn extract(text: &str, base_confidence: f32, currency: Option<Currency>) -> Vec<LineItem> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let section = find_line_item_section(&lines);

    let mut items = Vec::new();
    for line in section {
        if let Some(mut item) = parse_line(line, currency) {
            item.row_index = items.len();
            item.confidence = base_confidence;
            items.push(item);
        }
    }
    items
}

/// The region between a header-ish line (confirmed by a price pattern or
/// an explicit `description`/`item` keyword) and the first filler line.
fn find_line_item_section<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut section = Vec::new();
    let mut in_items = false;

    for line in lines {
        let lower = line.to_lowercase();
        let trimmed = lower.trim();

        if !in_items {
            if SECTION_START_KEYWORDS.iter().any(|kw| trimmed.contains(kw)) {
                let has_prices = PRICE_IN_LINE.is_match(line);
                if has_prices || trimmed.contains("description") || trimmed.contains("item") {
                    in_items = true;
                    continue;
                }
            }
            continue;
        }

        if SECTION_END_KEYWORDS.iter().any(|kw| trimmed.contains(kw)) {
            break;
        }
        if line.trim().len() > 3 {
            section.push(*line);
        }
    }

    // Without a recognizable header the whole block is fair game; rows
    // that parse are rows that count.
    if section.is_empty() && !in_items {
        return lines
            .iter()
            .copied()
            .take_while(|line| {
                let lower = line.to_lowercase();
                !SECTION_END_KEYWORDS.iter().any(|kw| lower.contains(kw))
            })
            .filter(|line| line.trim().len() > 3)
            .collect();
    }
    section
}

/// Try each row shape in order of specificity.
pub fn parse_line(line: &str, currency: Option<Currency>) -> Option<LineItem> {
    let line = line.trim();
    if line.len() < 5 {
        return None;
    }
    parse_pattern_line(line, currency)
        .or_else(|| parse_tabular_line(line, currency))
        .or_else(|| parse_space_separated_line(line, currency))
        .filter(|item| !item.description.is_empty())
}

fn amount(capture: &str, currency: Option<Currency>) -> Option<Amount> {
    Amount::from_capture(capture, currency)
}

fn item(
    description: String,
    quantity: Option<f64>,
    unit_price: Option<Amount>,
    line_total: Option<Amount>,
    currency: Option<Currency>,
) -> Option<LineItem> {
    let present = quantity.is_some() as usize
        + unit_price.is_some() as usize
        + line_total.is_some() as usize;
    if description.is_empty() || present < 2 {
        return None;
    }

    let mut unit_price = unit_price;
    let mut line_total = line_total;
    if line_total.is_none() {
        if let (Some(qty), Some(unit)) = (quantity, unit_price.as_ref().and_then(|a| a.major())) {
            line_total = Some(Amount::from_major(qty * unit, currency));
        }
    }
    if unit_price.is_none() {
        if let (Some(qty), Some(total)) = (quantity, line_total.as_ref().and_then(|a| a.major())) {
            if qty > 0.0 {
                unit_price = Some(Amount::from_major(total / qty, currency));
            }
        }
    }

    Some(LineItem {
        description,
        quantity,
        unit_price,
        line_total,
        vat: None,
        confidence: 0.0,
        row_index: 0,
        provenance: Provenance::Semantic,
    })
}

/// `Item Name 5 x £10.00 £50.00` and `Item Name £10.00 each 5 units £50.00`.
fn parse_pattern_line(line: &str, currency: Option<Currency>) -> Option<LineItem> {
    if let Some(caps) = QTY_X_PATTERN.captures(line) {
        return item(
            caps[1].trim().to_owned(),
            caps[2].parse().ok(),
            amount(&caps[3], currency),
            amount(&caps[4], currency),
            currency,
        );
    }
    if let Some(caps) = EACH_PATTERN.captures(line) {
        return item(
            caps[1].trim().to_owned(),
            caps[3].parse().ok(),
            amount(&caps[2], currency),
            amount(&caps[4], currency),
            currency,
        );
    }
    None
}

/// Tabular rows split by tabs, two-or-more-space runs, or pipes; at least
/// three parts required.
fn parse_tabular_line(line: &str, currency: Option<Currency>) -> Option<LineItem> {
    let parts: Vec<String> = if line.contains('\t') {
        line.split('\t').map(str::trim).map(str::to_owned).collect()
    } else if line.contains('|') {
        line.split('|').map(str::trim).map(str::to_owned).collect()
    } else {
        MULTI_SPACE
            .split(line)
            .map(str::trim)
            .map(str::to_owned)
            .collect()
    };
    let parts: Vec<String> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if parts.len() < 3 {
        return None;
    }

    interpret_parts(&parts, currency)
}

/// Single-space rows: `Widget 5 x £10.00 £50.00` variants that the
/// stricter shapes missed.
fn parse_space_separated_line(line: &str, currency: Option<Currency>) -> Option<LineItem> {
    let parts: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
    if parts.len() < 3 {
        return None;
    }
    interpret_parts(&parts, currency)
}

fn interpret_parts(parts: &[String], currency: Option<Currency>) -> Option<LineItem> {
    let mut description = String::new();
    let mut quantity: Option<f64> = None;
    let mut unit_price: Option<Amount> = None;
    let mut line_total: Option<Amount> = None;

    for part in parts {
        let lower = part.to_lowercase();
        if SECTION_END_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            continue;
        }

        if QTY_TOKEN.is_match(part) && quantity.is_none() && !part.contains('.') {
            quantity = part.parse().ok();
            continue;
        }

        let looks_priced = part.starts_with('£')
            || part.starts_with('€')
            || part.starts_with('$')
            || part.contains('.');
        if looks_priced {
            if let Some(caps) = PRICE_TOKEN.captures(part) {
                let value = amount(&caps[1], currency);
                if value.is_some() {
                    if unit_price.is_none() {
                        unit_price = value;
                    } else if line_total.is_none() {
                        line_total = value;
                    }
                    continue;
                }
            }
        }

        if description.is_empty() {
            description = part.clone();
        } else {
            description.push(' ');
            description.push_str(part);
        }
    }

    item(description, quantity, unit_price, line_total, currency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qty_x_pattern_parses_full_row() {
        let item = parse_line("Widget A 5 x £10.00 £50.00", Some(Currency::Gbp)).unwrap();
        assert_eq!(item.description, "Widget A");
        assert_eq!(item.quantity, Some(5.0));
        assert_eq!(item.unit_price.unwrap().major(), Some(10.0));
        assert_eq!(item.line_total.unwrap().major(), Some(50.0));
        assert_eq!(item.provenance, Provenance::Semantic);
    }

    #[test]
    fn each_units_pattern_parses() {
        let item =
            parse_line("Cola Case £4.50 each 24 units £108.00", Some(Currency::Gbp)).unwrap();
        assert_eq!(item.description, "Cola Case");
        assert_eq!(item.quantity, Some(24.0));
        assert_eq!(item.unit_price.unwrap().major(), Some(4.5));
        assert_eq!(item.line_total.unwrap().major(), Some(108.0));
    }

    #[test]
    fn terse_rows_from_ocr_text() {
        // Two-space-separated receipt rows with no explicit header.
        let text = "6  12 LITTRE PEPSI  78.49\n24  COLA CASE  4.50  108.00";
        let items = extract(text, 0.7, None);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "12 LITTRE PEPSI");
        assert_eq!(items[0].quantity, Some(6.0));
        assert_eq!(items[1].description, "COLA CASE");
        assert_eq!(items[1].quantity, Some(24.0));
        assert_eq!(items[1].line_total.as_ref().unwrap().major(), Some(108.0));
        assert!(items.iter().all(|i| i.provenance == Provenance::Semantic));
        assert_eq!(items[1].row_index, 1);
    }

    #[test]
    fn filler_lines_end_the_section() {
        let text = "Item  Qty  Price  Total\n\
                    Widget A  5  £10.00  £50.00\n\
                    Subtotal  £50.00\n\
                    Widget B  3  £15.00  £45.00";
        let items = extract(text, 0.8, Some(Currency::Gbp));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Widget A");
    }

    #[test]
    fn single_numeric_field_is_not_an_item() {
        assert!(parse_line("Just a description 5", None).is_none());
        assert!(parse_line("tiny", None).is_none());
    }

    #[test]
    fn single_price_reads_as_unit_and_derives_total() {
        let item = parse_line("BEANS  12  36.00", None).unwrap();
        assert_eq!(item.quantity, Some(12.0));
        assert_eq!(item.unit_price.as_ref().unwrap().major(), Some(36.0));
        assert_eq!(item.line_total.as_ref().unwrap().major(), Some(432.0));
    }

    #[test]
    fn empty_text_gives_no_items() {
        assert!(extract("", 0.5, None).is_empty());
        assert!(extract("   \n  ", 0.5, None).is_empty());
    }

    #[test]
    fn confidence_and_indices_are_assigned() {
        let text = "A WIDGET  2  5.00  10.00\nB WIDGET  3  5.00  15.00";
        let items = extract(text, 0.66, None);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| (i.confidence - 0.66).abs() < 1e-6));
        assert_eq!(items[0].row_index, 0);
        assert_eq!(items[1].row_index, 1);
    }
}
