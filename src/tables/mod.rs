//! Table reconstruction: both strategies run on every table block and the
//! higher-confidence result wins. Ties favor the geometric path when the
//! block has solid word-box coverage.

pub mod geometric;
pub mod semantic;

use tracing::instrument;

use crate::entities::{mean_confidence, BlockOcr, Currency, Provenance, TableResult};

/// Coverage above which a tie goes to the geometric path.
const COVERAGE_TIE_THRESHOLD: f32 = 0.8;

/// Fraction of the block's words that carry usable geometry.
pub fn word_box_coverage(block: &BlockOcr) -> f32 {
    let text_words = block.ocr_text.split_whitespace().count();
    if text_words == 0 {
        return 0.0;
    }
    let boxed = block
        .word_blocks
        .as_ref()
        .map(|w| w.len())
        .unwrap_or(0);
    (boxed as f32 / text_words as f32).min(1.0)
}

/// Reconstruct one table block. Always returns a result; an empty
/// `line_items` means both strategies came up dry and the reconciler will
/// treat the block as a review contribution.
#[instrument(skip_all)]
pub fn reconstruct_table(block: &BlockOcr, currency: Option<Currency>) -> TableResult {
    let geometric_table = block
        .word_blocks
        .as_deref()
        .map(|words| geometric::reconstruct(words, currency))
        .unwrap_or_default();
    let semantic_items = semantic::extract(&block.ocr_text, block.confidence, currency);

    let geo_score = (
        mean_confidence(geometric_table.line_items.iter().map(|i| i.confidence)),
        geometric_table.line_items.len(),
    );
    let sem_score = (
        mean_confidence(semantic_items.iter().map(|i| i.confidence)),
        semantic_items.len(),
    );

    let choose_geometric = if geo_score.0 > sem_score.0 {
        true
    } else if geo_score.0 < sem_score.0 {
        false
    } else if geo_score.1 != sem_score.1 {
        geo_score.1 > sem_score.1
    } else {
        word_box_coverage(block) >= COVERAGE_TIE_THRESHOLD
    };

    let (line_items, method_used, cell_count, row_count) = if choose_geometric {
        let cells = geometric_table.cell_count;
        let rows = geometric_table.rows.len();
        (geometric_table.line_items, Provenance::Geometric, cells, rows)
    } else {
        let cells = semantic_items
            .iter()
            .map(|i| {
                1 + i.quantity.is_some() as usize
                    + i.unit_price.is_some() as usize
                    + i.line_total.is_some() as usize
            })
            .sum();
        let rows = semantic_items.len();
        (semantic_items, Provenance::Semantic, cells, rows)
    };

    let confidence = TableResult::capped_confidence(block.confidence, &line_items);
    TableResult {
        bbox: block.bbox.clone(),
        line_items,
        method_used,
        confidence,
        fallback_used: method_used == Provenance::Semantic,
        cell_count,
        row_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BBox, BlockType, OcrMethod, WordBox};

    fn table_block(text: &str, words: Option<Vec<WordBox>>, confidence: f32) -> BlockOcr {
        BlockOcr {
            block_type: BlockType::Table,
            bbox: BBox::from_xywh(0.0, 100.0, 400.0, 200.0),
            ocr_text: text.to_owned(),
            confidence,
            method_used: OcrMethod::Primary,
            processing_time: 0.0,
            field_count: 0,
            line_count: 0,
            word_blocks: words,
            psm_hint: None,
            dropped_words: 0,
            layout_confidence: 0.8,
        }
    }

    fn word(text: &str, x: f32, y: f32, conf: f32) -> WordBox {
        WordBox {
            text: text.to_owned(),
            bbox: BBox::from_xywh(x, y, 20.0, 10.0),
            confidence: conf,
        }
    }

    #[test]
    fn geometric_wins_with_strong_word_boxes() {
        let words = vec![
            word("Widget", 10.0, 10.0, 0.95),
            word("5", 100.0, 10.0, 0.95),
            word("£10.00", 200.0, 10.0, 0.95),
            word("£50.00", 300.0, 10.0, 0.95),
        ];
        let block = table_block("Widget 5 £10.00 £50.00", Some(words), 0.9);
        let result = reconstruct_table(&block, Some(Currency::Gbp));

        assert_eq!(result.method_used, Provenance::Geometric);
        assert!(!result.fallback_used);
        assert_eq!(result.line_items.len(), 1);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.cell_count, 4);
    }

    #[test]
    fn semantic_wins_without_geometry() {
        let text = "6  12 LITTRE PEPSI  78.49\n24  COLA CASE  4.50  108.00";
        let block = table_block(text, None, 0.7);
        let result = reconstruct_table(&block, None);

        assert_eq!(result.method_used, Provenance::Semantic);
        assert!(result.fallback_used);
        assert_eq!(result.line_items.len(), 2);
        assert!(result
            .line_items
            .iter()
            .all(|i| i.provenance == Provenance::Semantic));
    }

    #[test]
    fn confidence_is_capped_by_block_and_items() {
        let text = "WIDGET  2  5.00  10.00";
        let block = table_block(text, None, 0.4);
        let result = reconstruct_table(&block, None);
        assert!(result.confidence <= 0.4 + 1e-6);
        let item_mean = mean_confidence(result.line_items.iter().map(|i| i.confidence));
        assert!(result.confidence <= item_mean + 1e-6);
    }

    #[test]
    fn empty_block_yields_empty_result() {
        let block = table_block("", None, 0.0);
        let result = reconstruct_table(&block, None);
        assert!(result.line_items.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn coverage_reflects_boxed_fraction() {
        let words = vec![word("a", 0.0, 0.0, 0.9), word("b", 30.0, 0.0, 0.9)];
        let block = table_block("a b c d", Some(words), 0.9);
        assert!((word_box_coverage(&block) - 0.5).abs() < 1e-6);
        let empty = table_block("", None, 0.9);
        assert_eq!(word_box_coverage(&empty), 0.0);
    }
}
