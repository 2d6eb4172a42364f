//! Geometric table reconstruction: spatial clustering of OCR word boxes
//! into rows and cells, stable top-to-bottom then left-to-right.

use lazy_static::lazy_static;
use regex::Regex;

use crate::entities::{
    mean_confidence, Amount, BBox, Currency, LineItem, Provenance, WordBox,
};

/// A new row opens when a word's y-center drifts further than this from
/// the previous word's.
pub const ROW_GAP_PX: f32 = 15.0;
/// A new cell opens when the horizontal gap between word origins exceeds
/// this.
pub const CELL_GAP_PX: f32 = 25.0;

const HEADER_KEYWORDS: [&str; 8] = [
    "item",
    "description",
    "product",
    "qty",
    "quantity",
    "unit price",
    "total",
    "amount",
];

lazy_static! {
    static ref NUMERIC: Regex = Regex::new(r"^\d+(?:\.\d+)?$").unwrap();
    static ref MONEY: Regex = Regex::new(r"^[£€$]\s*(\d+(?:,\d+)*(?:\.\d{1,2})?)$").unwrap();
}

/// One cell of a reconstructed row.
#[derive(Debug, Clone)]
pub struct Cell {
    pub bbox: BBox,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct Row(pub Vec<Cell>);

impl Row {
    pub fn confidence(&self) -> f32 {
        mean_confidence(self.0.iter().map(|c| c.confidence))
    }
}

#[derive(Debug, Default)]
pub struct GeometricTable {
    pub rows: Vec<Row>,
    pub line_items: Vec<LineItem>,
    pub cell_count: usize,
}

/// Cluster word boxes into rows by y-center proximity.
pub fn cluster_rows(words: &[WordBox]) -> Vec<Vec<&WordBox>> {
    let mut sorted: Vec<&WordBox> = words.iter().collect();
    sorted.sort_by(|a, b| {
        a.bbox
            .center()
            .1
            .partial_cmp(&b.bbox.center().1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut rows: Vec<Vec<&WordBox>> = Vec::new();
    let mut last_y: Option<f32> = None;
    for word in sorted {
        let y = word.bbox.center().1;
        match last_y {
            Some(prev) if (y - prev).abs() <= ROW_GAP_PX => rows.last_mut().unwrap().push(word),
            _ => rows.push(vec![word]),
        }
        last_y = Some(y);
    }
    rows
}

/// Split a row into cells on horizontal gaps.
pub fn cluster_cells(mut row: Vec<&WordBox>) -> Vec<Cell> {
    row.sort_by(|a, b| {
        a.bbox
            .x0
            .partial_cmp(&b.bbox.x0)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cells: Vec<Vec<&WordBox>> = Vec::new();
    let mut last_x: Option<f32> = None;
    for word in row {
        match last_x {
            Some(prev) if (word.bbox.x0 - prev).abs() <= CELL_GAP_PX => {
                cells.last_mut().unwrap().push(word)
            }
            _ => cells.push(vec![word]),
        }
        last_x = Some(word.bbox.x0);
    }

    cells
        .into_iter()
        .map(|words| {
            let mut bbox = words[0].bbox.clone();
            for w in &words[1..] {
                bbox.merge(&w.bbox);
            }
            Cell {
                bbox,
                text: words
                    .iter()
                    .map(|w| w.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                confidence: mean_confidence(words.iter().map(|w| w.confidence)),
            }
        })
        .collect()
}

/// The first row where most cells carry header vocabulary.
pub fn is_header_row(row: &Row) -> bool {
    if row.0.is_empty() {
        return false;
    }
    let matches = row
        .0
        .iter()
        .filter(|cell| {
            let lower = cell.text.to_lowercase();
            HEADER_KEYWORDS.iter().any(|kw| lower.contains(kw))
        })
        .count();
    matches * 2 > row.0.len()
}

/// Interpret a data row's cells into a line item. Numeric tokens fill
/// quantity, then unit price, then line total; currency-marked tokens go
/// straight to the price columns; everything else joins the description.
fn interpret_row(row: &Row, row_index: usize, currency: Option<Currency>) -> Option<LineItem> {
    let mut description = String::new();
    let mut quantity: Option<f64> = None;
    let mut unit_price: Option<Amount> = None;
    let mut line_total: Option<Amount> = None;

    for cell in &row.0 {
        let text = cell.text.trim();
        if text.is_empty() {
            continue;
        }
        if let Some(captures) = MONEY.captures(text) {
            let amount = Amount::from_capture(&captures[1], currency);
            if unit_price.is_none() {
                unit_price = amount;
            } else if line_total.is_none() {
                line_total = amount;
            }
            continue;
        }
        if NUMERIC.is_match(text) {
            if quantity.is_none() {
                quantity = text.parse().ok();
            } else if unit_price.is_none() {
                unit_price = Amount::from_capture(text, currency);
            } else if line_total.is_none() {
                line_total = Amount::from_capture(text, currency);
            }
            continue;
        }
        if description.is_empty() {
            description.push_str(text);
        } else {
            description.push(' ');
            description.push_str(text);
        }
    }

    if description.is_empty() {
        return None;
    }
    let numeric_fields =
        quantity.is_some() as usize + unit_price.is_some() as usize + line_total.is_some() as usize;
    if numeric_fields == 0 {
        return None;
    }

    // Derive the missing member when the other two are present.
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
        confidence: row.confidence(),
        row_index,
        provenance: Provenance::Geometric,
    })
}

/// Reconstruct a table from the word boxes of one table block.
pub fn reconstruct(words: &[WordBox], currency: Option<Currency>) -> GeometricTable {
    if words.is_empty() {
        return GeometricTable::default();
    }

    let rows: Vec<Row> = cluster_rows(words)
        .into_iter()
        .map(|row| Row(cluster_cells(row)))
        .collect();
    let cell_count = rows.iter().map(|r| r.0.len()).sum();

    let header_index = rows.iter().position(is_header_row);
    let data_start = header_index.map(|i| i + 1).unwrap_or(0);

    let mut line_items = Vec::new();
    for row in rows.iter().skip(data_start) {
        if let Some(item) = interpret_row(row, line_items.len(), currency) {
            line_items.push(item);
        }
    }

    GeometricTable {
        rows,
        line_items,
        cell_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, x: f32, y: f32, w: f32, h: f32, conf: f32) -> WordBox {
        WordBox {
            text: text.to_owned(),
            bbox: BBox::from_xywh(x, y, w, h),
            confidence: conf,
        }
    }

    /// Four-column table: Item | Qty | Price | Total, three data rows.
    fn sample_table() -> Vec<WordBox> {
        let mut words = Vec::new();
        let header = ["Item", "Qty", "Price", "Total"];
        let xs = [10.0, 160.0, 260.0, 380.0];
        for (text, x) in header.iter().zip(xs) {
            words.push(word(text, x, 10.0, 50.0, 12.0, 0.95));
        }
        let rows = [
            (["Widget", "A"], "5", "£10.00", "£50.00", 40.0),
            (["Widget", "B"], "3", "£15.00", "£45.00", 70.0),
            (["Widget", "C"], "2", "£20.00", "£40.00", 100.0),
        ];
        for (desc, qty, price, total, y) in rows {
            words.push(word(desc[0], 10.0, y, 18.0, 12.0, 0.9));
            words.push(word(desc[1], 30.0, y, 10.0, 12.0, 0.9));
            words.push(word(qty, 160.0, y, 12.0, 12.0, 0.92));
            words.push(word(price, 260.0, y, 45.0, 12.0, 0.9));
            words.push(word(total, 380.0, y, 45.0, 12.0, 0.9));
        }
        words
    }

    #[test]
    fn rows_cluster_by_y_center() {
        let words = sample_table();
        let rows = cluster_rows(&words);
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn cells_split_on_horizontal_gaps() {
        let words = sample_table();
        let rows = cluster_rows(&words);
        // The data rows merge "Widget" + letter into one description cell.
        let cells = cluster_cells(rows[1].clone());
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[0].text, "Widget A");
        assert_eq!(cells[1].text, "5");
    }

    #[test]
    fn header_row_is_detected_and_skipped() {
        let table = reconstruct(&sample_table(), Some(Currency::Gbp));
        assert_eq!(table.rows.len(), 4);
        assert!(is_header_row(&table.rows[0]));
        assert_eq!(table.line_items.len(), 3);
    }

    #[test]
    fn items_carry_exact_values_in_minor_units() {
        let table = reconstruct(&sample_table(), Some(Currency::Gbp));
        let first = &table.line_items[0];
        assert_eq!(first.description, "Widget A");
        assert_eq!(first.quantity, Some(5.0));
        assert_eq!(
            first.unit_price,
            Some(Amount::Minor {
                minor: 1000,
                currency: Currency::Gbp
            })
        );
        assert_eq!(
            first.line_total,
            Some(Amount::Minor {
                minor: 5000,
                currency: Currency::Gbp
            })
        );
        assert_eq!(first.provenance, Provenance::Geometric);
        assert_eq!(first.row_index, 0);
        let total: f64 = table
            .line_items
            .iter()
            .filter_map(|i| i.line_total.as_ref().and_then(|a| a.major()))
            .sum();
        assert_eq!(total, 135.0);
    }

    #[test]
    fn missing_total_is_derived_from_qty_and_unit() {
        let words = vec![
            word("Bolt", 10.0, 10.0, 30.0, 10.0, 0.9),
            word("4", 160.0, 10.0, 10.0, 10.0, 0.9),
            word("£2.50", 260.0, 10.0, 30.0, 10.0, 0.9),
        ];
        let table = reconstruct(&words, Some(Currency::Gbp));
        assert_eq!(table.line_items.len(), 1);
        assert_eq!(
            table.line_items[0].line_total,
            Some(Amount::Minor {
                minor: 1000,
                currency: Currency::Gbp
            })
        );
    }

    #[test]
    fn description_only_rows_are_dropped() {
        let words = vec![
            word("Delivery", 10.0, 10.0, 40.0, 10.0, 0.9),
            word("note", 60.0, 10.0, 30.0, 10.0, 0.9),
        ];
        let table = reconstruct(&words, None);
        assert!(table.line_items.is_empty());
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn empty_words_yield_empty_table() {
        let table = reconstruct(&[], None);
        assert!(table.rows.is_empty());
        assert!(table.line_items.is_empty());
        assert_eq!(table.cell_count, 0);
    }
}
