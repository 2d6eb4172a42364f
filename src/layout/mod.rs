//! Layout detection: classify the page into typed rectangular blocks.
//!
//! Primary path runs the injected layout model and maps its label space
//! into the invoice block set; without a model (or when it finds nothing)
//! the heuristic fallback takes over; if both come up empty a single
//! degenerate full-page body block is emitted so downstream stages always
//! have something to chew on.

pub mod fallback;
pub mod model;

use std::time::Instant;

use image::{DynamicImage, GrayImage};
use tracing::instrument;

use crate::engines::LayoutModel;
use crate::entities::{BBox, BlockSource, BlockType, LayoutBlock, PageIndex, PageLayout};

pub const DEGENERATE_CONFIDENCE: f32 = 0.3;

/// Map a detector label into the invoice block set. Models fine-tuned on
/// form corpora emit `Handwriting`/`Signature` alongside the DocLayNet
/// set; both route to the handwriting block type for the HTR pass.
pub fn map_label(label: &str) -> BlockType {
    match label {
        "Text" | "Title" | "Page-header" | "Section-header" => BlockType::Header,
        "List" | "List-item" | "Table" => BlockType::Table,
        "Figure" | "Picture" | "Caption" | "Page-footer" | "Footnote" => BlockType::Footer,
        "Handwriting" | "Signature" => BlockType::Handwriting,
        _ => BlockType::Body,
    }
}

/// Detect the layout of one preprocessed page.
#[instrument(skip_all, fields(page_index))]
pub fn detect_page_layout(
    layout_model: Option<&dyn LayoutModel>,
    gray: &GrayImage,
    page_index: PageIndex,
) -> PageLayout {
    let started = Instant::now();
    let (width, height) = gray.dimensions();

    let mut blocks = Vec::new();
    let mut method_used = "degenerate";

    if let Some(model) = layout_model {
        let page = DynamicImage::ImageLuma8(gray.clone());
        match model.detect(&page) {
            Ok(detections) => {
                blocks = detections
                    .into_iter()
                    .map(|d| LayoutBlock {
                        block_type: map_label(&d.label),
                        bbox: d.bbox,
                        confidence: d.score,
                        source: BlockSource::Primary,
                    })
                    .collect();
                if !blocks.is_empty() {
                    method_used = "model";
                }
            }
            Err(e) => {
                tracing::warn!(page_index, error = %e, "layout model failed, using fallback");
            }
        }
    }

    if blocks.is_empty() {
        blocks = fallback::detect_fallback(gray);
        if !blocks.is_empty() {
            method_used = "heuristic_fallback";
        }
    }

    if blocks.is_empty() {
        blocks = vec![degenerate_block(width, height)];
    }

    // Clamp to the page and drop anything that collapsed.
    blocks = blocks
        .into_iter()
        .filter_map(|mut b| {
            b.bbox = b.bbox.clamp_to(width as f32, height as f32);
            if b.bbox.is_degenerate() {
                None
            } else {
                Some(b)
            }
        })
        .collect();
    if blocks.is_empty() {
        blocks = vec![degenerate_block(width, height)];
        method_used = "degenerate";
    }

    // Stable emission order: top-to-bottom, then left-to-right.
    blocks.sort_by(|a, b| {
        (a.bbox.y0, a.bbox.x0)
            .partial_cmp(&(b.bbox.y0, b.bbox.x0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut layout = PageLayout::new(page_index, blocks, method_used);
    layout.processing_time = started.elapsed().as_secs_f64();
    layout
}

fn degenerate_block(width: u32, height: u32) -> LayoutBlock {
    LayoutBlock {
        block_type: BlockType::Body,
        bbox: BBox {
            x0: 0.0,
            y0: 0.0,
            x1: width.max(1) as f32,
            y1: height.max(1) as f32,
        },
        confidence: DEGENERATE_CONFIDENCE,
        source: BlockSource::Degenerate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::ModelDetection;
    use image::Luma;

    struct FixedModel(Vec<ModelDetection>);

    impl LayoutModel for FixedModel {
        fn detect(&self, _page: &DynamicImage) -> anyhow::Result<Vec<ModelDetection>> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl LayoutModel for FailingModel {
        fn detect(&self, _page: &DynamicImage) -> anyhow::Result<Vec<ModelDetection>> {
            anyhow::bail!("session crashed")
        }
    }

    fn detection(label: &str, x0: f32, y0: f32, x1: f32, y1: f32, score: f32) -> ModelDetection {
        ModelDetection {
            label: label.to_owned(),
            bbox: BBox { x0, y0, x1, y1 },
            score,
        }
    }

    #[test]
    fn label_mapping_targets_invoice_set() {
        assert_eq!(map_label("Text"), BlockType::Header);
        assert_eq!(map_label("Title"), BlockType::Header);
        assert_eq!(map_label("Table"), BlockType::Table);
        assert_eq!(map_label("List-item"), BlockType::Table);
        assert_eq!(map_label("Figure"), BlockType::Footer);
        assert_eq!(map_label("Caption"), BlockType::Footer);
        assert_eq!(map_label("Handwriting"), BlockType::Handwriting);
        assert_eq!(map_label("Signature"), BlockType::Handwriting);
        assert_eq!(map_label("Formula"), BlockType::Body);
        assert_eq!(map_label("whatever"), BlockType::Body);
    }

    #[test]
    fn model_blocks_are_clamped_and_sorted() {
        let gray = GrayImage::from_pixel(200, 100, Luma([255]));
        let model = FixedModel(vec![
            detection("Table", 10.0, 50.0, 190.0, 90.0, 0.9),
            detection("Text", -20.0, 5.0, 150.0, 30.0, 0.8),
        ]);
        let layout = detect_page_layout(Some(&model), &gray, 1);

        assert_eq!(layout.method_used, "model");
        assert_eq!(layout.blocks.len(), 2);
        // Sorted top-to-bottom, clamped into the page.
        assert_eq!(layout.blocks[0].block_type, BlockType::Header);
        assert_eq!(layout.blocks[0].bbox.x0, 0.0);
        assert_eq!(layout.blocks[1].block_type, BlockType::Table);
        assert!((layout.blocks[0].confidence - 0.8).abs() < 1e-6);
        assert!((layout.confidence_avg - 0.85).abs() < 1e-6);
    }

    #[test]
    fn failing_model_falls_back_to_heuristics() {
        let gray = GrayImage::from_pixel(300, 600, Luma([255]));
        let layout = detect_page_layout(Some(&FailingModel), &gray, 2);
        assert_eq!(layout.method_used, "heuristic_fallback");
        assert_eq!(layout.blocks.len(), 3);
        assert_eq!(layout.page_num, 2);
    }

    #[test]
    fn empty_detections_never_leave_a_page_without_blocks() {
        let gray = GrayImage::from_pixel(10, 10, Luma([255]));
        // Heuristics on a tiny blank page produce a thirds split, so force
        // the degenerate case with zero-area detections.
        let model = FixedModel(vec![detection("Text", 5.0, 5.0, 5.0, 5.0, 0.9)]);
        let layout = detect_page_layout(Some(&model), &gray, 1);
        assert!(!layout.blocks.is_empty());
        for block in &layout.blocks {
            assert!(!block.bbox.is_degenerate());
        }
    }

    #[test]
    fn degenerate_page_gets_full_page_body_block() {
        let layout = PageLayout::new(1, vec![degenerate_block(100, 50)], "degenerate");
        assert_eq!(layout.blocks[0].block_type, BlockType::Body);
        assert_eq!(layout.blocks[0].confidence, DEGENERATE_CONFIDENCE);
        assert_eq!(layout.confidence_avg, DEGENERATE_CONFIDENCE);
        assert_eq!(layout.blocks[0].bbox.to_xywh(), [0, 0, 100, 50]);
    }
}
