//! Per-block OCR.
//!
//! Each block is cropped from the preprocessed page, lightly denoised for
//! its type, and run through the primary recognizer with orientation
//! classification. Empty output or low confidence routes the crop to the
//! secondary recognizer with a block-type PSM hint; the secondary result
//! is accepted only when it strictly beats the primary. Table blocks keep
//! their word geometry for the reconstructor.

use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::filter::bilateral_filter;
use itertools::Itertools;
use tracing::instrument;

use crate::engines::{adapter, EngineBundle, PsmHint};
use crate::entities::{
    mean_confidence, BlockOcr, BlockType, LayoutBlock, OcrMethod, PageIndex, PageLayout, PageOcr,
    PreprocPath, WordBox,
};
use crate::errors::StageError;

/// Primary results under this confidence are retried on the secondary.
pub const SECONDARY_TRIGGER_CONFIDENCE: f32 = 0.3;

const PLACEHOLDER_W: u32 = 200;
const PLACEHOLDER_H: u32 = 50;

pub fn psm_for(block_type: BlockType) -> PsmHint {
    match block_type {
        BlockType::Header => PsmHint::SingleLine,
        BlockType::Table | BlockType::Body | BlockType::Footer | BlockType::Handwriting => {
            PsmHint::UniformBlock
        }
    }
}

/// Crop a block out of the page, clamping to bounds. An empty crop
/// becomes a white placeholder so downstream code never sees a zero-size
/// image.
pub fn crop_block(page: &GrayImage, block: &LayoutBlock) -> (GrayImage, bool) {
    let (page_w, page_h) = page.dimensions();
    let bbox = block.bbox.clamp_to(page_w as f32, page_h as f32);
    let x = bbox.x0.floor().max(0.0) as u32;
    let y = bbox.y0.floor().max(0.0) as u32;
    let w = (bbox.width().ceil() as u32).min(page_w.saturating_sub(x));
    let h = (bbox.height().ceil() as u32).min(page_h.saturating_sub(y));

    if w == 0 || h == 0 {
        return (
            GrayImage::from_pixel(PLACEHOLDER_W, PLACEHOLDER_H, Luma([255])),
            true,
        );
    }
    (image::imageops::crop_imm(page, x, y, w, h).to_image(), false)
}

/// Block-type-specific light denoise. Handwriting gets a stronger pass;
/// tables stay gentle to preserve structure. Never binarize here.
fn preprocess_crop(crop: &GrayImage, block_type: BlockType) -> GrayImage {
    match block_type {
        BlockType::Handwriting => bilateral_filter(crop, 9, 75.0, 75.0),
        _ => bilateral_filter(crop, 5, 50.0, 50.0),
    }
}

/// Field/line census over the recognized text: lines overall, lines that
/// look like data fields (carry digits or a currency mark).
fn analyze_text(text: &str) -> (usize, usize) {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let field_count = lines
        .iter()
        .filter(|l| l.chars().any(|c| c.is_ascii_digit() || "£€$".contains(c)))
        .count();
    (field_count, lines.len())
}

fn degenerate_result(block: &LayoutBlock, elapsed: f64) -> BlockOcr {
    BlockOcr {
        block_type: block.block_type,
        bbox: block.bbox.clone(),
        ocr_text: String::new(),
        confidence: 0.0,
        method_used: OcrMethod::Degenerate,
        processing_time: elapsed,
        field_count: 0,
        line_count: 0,
        word_blocks: None,
        psm_hint: None,
        dropped_words: 0,
        layout_confidence: block.confidence,
    }
}

/// OCR one block. Non-fatal engine failures are pushed into `errors` and
/// degrade the result instead of aborting the page.
pub fn ocr_block(
    engines: &EngineBundle,
    page: &GrayImage,
    block: &LayoutBlock,
    errors: &mut Vec<String>,
) -> BlockOcr {
    let started = Instant::now();
    let (crop, empty) = crop_block(page, block);
    if empty {
        return degenerate_result(block, started.elapsed().as_secs_f64());
    }
    let processed = preprocess_crop(&crop, block.block_type);

    let mut text = String::new();
    let mut confidence = 0.0f32;
    let mut method_used = OcrMethod::Degenerate;
    let mut word_blocks: Option<Vec<WordBox>> = None;
    let mut psm_hint = None;
    let mut dropped_words = 0usize;

    if let Some(primary) = &engines.primary_ocr {
        match primary.recognize(&processed, true) {
            Ok(payload) => {
                let normalized = adapter::normalize_payload(&payload);
                text = normalized.full_text();
                confidence = normalized.mean_confidence();
                dropped_words = normalized.dropped;
                method_used = OcrMethod::Primary;
                if block.block_type == BlockType::Table {
                    // Word geometry is crop-relative; shift into page space.
                    let words: Vec<WordBox> = normalized
                        .hits
                        .iter()
                        .filter_map(|hit| {
                            let mut bbox = hit.bbox()?;
                            bbox.x0 += block.bbox.x0;
                            bbox.x1 += block.bbox.x0;
                            bbox.y0 += block.bbox.y0;
                            bbox.y1 += block.bbox.y0;
                            Some(WordBox {
                                text: hit.text.clone(),
                                bbox,
                                confidence: hit.confidence,
                            })
                        })
                        .collect();
                    word_blocks = Some(words);
                }
            }
            Err(e) => {
                errors.push(StageError::OcrBlockFailure(e.to_string()).record());
            }
        }
    }

    let needs_secondary = text.is_empty() || confidence < SECONDARY_TRIGGER_CONFIDENCE;
    if needs_secondary {
        if let Some(secondary) = &engines.secondary_ocr {
            let psm = psm_for(block.block_type);
            match secondary.recognize(&processed, psm) {
                Ok(lines) => {
                    // Secondary wins only when strictly better.
                    if !lines.text.is_empty() && lines.confidence > confidence {
                        text = lines.text;
                        confidence = lines.confidence;
                        method_used = OcrMethod::Secondary;
                        psm_hint = Some(psm.tesseract_mode().to_string());
                        if block.block_type == BlockType::Table {
                            word_blocks = Some(Vec::new());
                        }
                    }
                }
                Err(e) => {
                    errors.push(StageError::OcrBlockFailure(e.to_string()).record());
                }
            }
        }
    }

    if text.is_empty() {
        method_used = OcrMethod::Degenerate;
    }

    let (field_count, line_count) = analyze_text(&text);
    BlockOcr {
        block_type: block.block_type,
        bbox: block.bbox.clone(),
        ocr_text: text,
        confidence,
        method_used,
        processing_time: started.elapsed().as_secs_f64(),
        field_count,
        line_count,
        word_blocks,
        psm_hint,
        dropped_words,
        layout_confidence: block.confidence,
    }
}

/// OCR every block on a page, in the layout detector's order.
#[instrument(skip_all, fields(page_index))]
pub fn ocr_page(
    engines: &EngineBundle,
    page: &GrayImage,
    layout: &PageLayout,
    preproc_path: PreprocPath,
    page_index: PageIndex,
    conf_field_min: f32,
) -> PageOcr {
    let started = Instant::now();
    let mut errors = Vec::new();

    let blocks: Vec<BlockOcr> = layout
        .blocks
        .iter()
        .map(|block| ocr_block(engines, page, block, &mut errors))
        .collect();

    let low_confidence_blocks = blocks
        .iter()
        .filter(|b| b.confidence < conf_field_min)
        .count();
    let confidence_avg = mean_confidence(blocks.iter().map(|b| b.confidence));

    // Dominant engine across blocks; ties prefer the stronger engine.
    let counts = blocks.iter().map(|b| b.method_used).counts();
    let method_used = [
        OcrMethod::Degenerate,
        OcrMethod::Secondary,
        OcrMethod::Primary,
    ]
    .into_iter()
    .max_by_key(|m| counts.get(m).copied().unwrap_or(0))
    .unwrap();

    PageOcr {
        page_num: page_index,
        blocks,
        processing_time: started.elapsed().as_secs_f64(),
        method_used,
        confidence_avg,
        low_confidence_blocks,
        preprocessing_path: preproc_path,
        errors,
    }
}

/// Full-page OCR metrics for the preprocessing comparator: mean
/// confidence and word count.
pub fn full_page_metrics(engines: &EngineBundle, page: &GrayImage) -> Option<(f32, usize)> {
    if let Some(primary) = &engines.primary_ocr {
        if let Ok(payload) = primary.recognize(page, true) {
            let normalized = adapter::normalize_payload(&payload);
            return Some((normalized.mean_confidence(), normalized.word_count()));
        }
    }
    if let Some(secondary) = &engines.secondary_ocr {
        if let Ok(lines) = secondary.recognize(page, PsmHint::UniformBlock) {
            let words = lines.text.split_whitespace().count();
            return Some((lines.confidence, words));
        }
    }
    None
}
