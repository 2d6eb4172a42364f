//! Heuristic layout detection, used when no model is available or the
//! model returns nothing.
//!
//! Tables show up as bands of long horizontal separators; everything else
//! is classified from contour position on the page (top 30% header,
//! bottom 30% footer, middle body), except that a sparse-ink region in
//! the bottom zone reads as handwriting (signatures are loose, thin
//! strokes where printed footers are dense). A page with no detectable
//! structure is split into thirds.

use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::edges::canny;

use crate::entities::{BBox, BlockSource, BlockType, LayoutBlock};

const TABLE_CONFIDENCE: f32 = 0.7;
const REGION_CONFIDENCE: f32 = 0.6;
const THIRDS_CONFIDENCE: f32 = 0.5;

/// Minimum separators stacked vertically before a band counts as a table.
const MIN_TABLE_SEPARATORS: usize = 3;
/// A contour must cover at least this share of the page.
const MIN_REGION_AREA_RATIO: f32 = 0.05;
/// Bottom-zone regions with ink coverage under this are handwriting.
const HANDWRITING_MAX_INK_DENSITY: f32 = 0.08;

pub fn detect_fallback(gray: &GrayImage) -> Vec<LayoutBlock> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }

    // Dark ink on light paper becomes foreground.
    let binary = threshold(gray, 128, ThresholdType::BinaryInverted);
    let mut blocks = Vec::new();

    let table_regions = find_table_regions(&binary);
    for bbox in &table_regions {
        blocks.push(LayoutBlock {
            block_type: BlockType::Table,
            bbox: bbox.clone(),
            confidence: TABLE_CONFIDENCE,
            source: BlockSource::Fallback,
        });
    }

    for (block_type, bbox) in find_other_regions(gray, &binary, &table_regions) {
        blocks.push(LayoutBlock {
            block_type,
            bbox,
            confidence: REGION_CONFIDENCE,
            source: BlockSource::Fallback,
        });
    }

    if blocks.is_empty() {
        blocks = split_into_thirds(w, h);
    }

    blocks
}

/// Long runs of dark pixels mark horizontal rules; three or more stacked
/// rules span a table band.
fn find_table_regions(binary: &GrayImage) -> Vec<BBox> {
    let (w, h) = binary.dimensions();
    let min_run = (w / 4).max(1);

    let mut separator_rows = Vec::new();
    for y in 0..h {
        let mut run = 0u32;
        let mut longest = 0u32;
        for x in 0..w {
            if binary.get_pixel(x, y).0[0] > 0 {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        if longest >= min_run {
            separator_rows.push(y);
        }
    }

    // Adjacent rows belong to the same (thick) rule; count distinct rules.
    let mut rule_count = 0usize;
    let mut last_row: Option<u32> = None;
    for &y in &separator_rows {
        if last_row.map(|last| y > last + 2).unwrap_or(true) {
            rule_count += 1;
        }
        last_row = Some(y);
    }

    if rule_count >= MIN_TABLE_SEPARATORS {
        let start = *separator_rows.first().unwrap() as f32;
        let end = *separator_rows.last().unwrap() as f32;
        if end > start {
            return vec![BBox {
                x0: 0.0,
                y0: start,
                x1: w as f32,
                y1: end,
            }];
        }
    }
    Vec::new()
}

/// Contour-based region proposals for non-table content, classified by
/// `classify_region` and filtered against the table bands.
fn find_other_regions(
    gray: &GrayImage,
    binary: &GrayImage,
    table_regions: &[BBox],
) -> Vec<(BlockType, BBox)> {
    let (w, h) = gray.dimensions();
    let edges = canny(gray, 50.0, 150.0);
    let contours = find_contours::<i32>(&edges);
    let page_area = (w * h) as f32;

    let mut regions = Vec::new();
    for contour in &contours {
        if contour.points.is_empty() {
            continue;
        }
        let mut bbox = BBox {
            x0: f32::MAX,
            y0: f32::MAX,
            x1: f32::MIN,
            y1: f32::MIN,
        };
        for p in &contour.points {
            bbox.x0 = bbox.x0.min(p.x as f32);
            bbox.y0 = bbox.y0.min(p.y as f32);
            bbox.x1 = bbox.x1.max(p.x as f32);
            bbox.y1 = bbox.y1.max(p.y as f32);
        }
        if bbox.area() < page_area * MIN_REGION_AREA_RATIO {
            continue;
        }
        if table_regions.iter().any(|t| t.intersection(&bbox) > 0.0) {
            continue;
        }

        let block_type = classify_region(binary, &bbox, h as f32);
        regions.push((block_type, bbox));
    }
    regions
}

/// Vertical position decides header/body/footer; in the bottom zone a
/// region whose strokes cover almost none of its area is a signature or
/// handwritten note, not a printed footer.
fn classify_region(binary: &GrayImage, bbox: &BBox, page_height: f32) -> BlockType {
    if bbox.y0 < page_height * 0.3 {
        return BlockType::Header;
    }
    if bbox.y0 > page_height * 0.7 {
        let density = ink_density(binary, bbox);
        if density > 0.0 && density < HANDWRITING_MAX_INK_DENSITY {
            return BlockType::Handwriting;
        }
        return BlockType::Footer;
    }
    BlockType::Body
}

/// Fraction of foreground pixels inside the region.
fn ink_density(binary: &GrayImage, bbox: &BBox) -> f32 {
    let (w, h) = binary.dimensions();
    let clamped = bbox.clamp_to(w as f32, h as f32);
    let x0 = clamped.x0.floor().max(0.0) as u32;
    let y0 = clamped.y0.floor().max(0.0) as u32;
    let x1 = (clamped.x1.ceil() as u32).min(w);
    let y1 = (clamped.y1.ceil() as u32).min(h);
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }

    let mut dark = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            if binary.get_pixel(x, y).0[0] > 0 {
                dark += 1;
            }
        }
    }
    dark as f32 / ((x1 - x0) * (y1 - y0)) as f32
}

fn split_into_thirds(w: u32, h: u32) -> Vec<LayoutBlock> {
    let third = h as f32 / 3.0;
    [
        (BlockType::Header, 0.0),
        (BlockType::Body, third),
        (BlockType::Footer, 2.0 * third),
    ]
    .into_iter()
    .map(|(block_type, y0)| LayoutBlock {
        block_type,
        bbox: BBox {
            x0: 0.0,
            y0,
            x1: w as f32,
            y1: y0 + third,
        },
        confidence: THIRDS_CONFIDENCE,
        source: BlockSource::Fallback,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn blank_page_splits_into_thirds() {
        let gray = GrayImage::from_pixel(300, 600, Luma([255]));
        let blocks = detect_fallback(&gray);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].block_type, BlockType::Header);
        assert_eq!(blocks[1].block_type, BlockType::Body);
        assert_eq!(blocks[2].block_type, BlockType::Footer);
        assert!(blocks.iter().all(|b| b.confidence == THIRDS_CONFIDENCE));
        // Thirds tile the page top to bottom.
        assert_eq!(blocks[0].bbox.y0, 0.0);
        assert_eq!(blocks[2].bbox.y1, 600.0);
    }

    #[test]
    fn ruled_table_band_is_detected() {
        let mut gray = GrayImage::from_pixel(400, 600, Luma([255]));
        // Three full-width horizontal rules.
        for &y in &[200u32, 250, 300] {
            for x in 20..380 {
                gray.put_pixel(x, y, Luma([0]));
            }
        }
        let blocks = detect_fallback(&gray);
        let table = blocks
            .iter()
            .find(|b| b.block_type == BlockType::Table)
            .expect("table band detected");
        assert!(table.bbox.y0 >= 199.0 && table.bbox.y1 <= 301.0);
        assert_eq!(table.source, BlockSource::Fallback);
    }

    #[test]
    fn short_rules_are_not_tables() {
        let mut gray = GrayImage::from_pixel(400, 600, Luma([255]));
        // Runs shorter than w/4 never become separators.
        for &y in &[200u32, 250, 300] {
            for x in 20..60 {
                gray.put_pixel(x, y, Luma([0]));
            }
        }
        let blocks = detect_fallback(&gray);
        assert!(blocks.iter().all(|b| b.block_type != BlockType::Table));
    }

    #[test]
    fn sparse_bottom_strokes_classify_as_handwriting() {
        let mut binary = GrayImage::from_pixel(400, 600, Luma([0]));
        // A thin wavy stroke across the signature zone.
        for x in 60..340u32 {
            let y = 510 + (x % 40) / 2;
            binary.put_pixel(x, y, Luma([255]));
        }
        let bbox = BBox {
            x0: 60.0,
            y0: 490.0,
            x1: 340.0,
            y1: 560.0,
        };
        assert_eq!(classify_region(&binary, &bbox, 600.0), BlockType::Handwriting);
    }

    #[test]
    fn dense_bottom_ink_classifies_as_footer() {
        let mut binary = GrayImage::from_pixel(400, 600, Luma([0]));
        // A solid printed footer block.
        for y in 500..560u32 {
            for x in 50..350 {
                binary.put_pixel(x, y, Luma([255]));
            }
        }
        let bbox = BBox {
            x0: 50.0,
            y0: 500.0,
            x1: 350.0,
            y1: 560.0,
        };
        assert_eq!(classify_region(&binary, &bbox, 600.0), BlockType::Footer);
    }

    #[test]
    fn position_rules_still_hold_outside_the_bottom_zone() {
        let binary = GrayImage::from_pixel(400, 600, Luma([0]));
        let top = BBox {
            x0: 0.0,
            y0: 10.0,
            x1: 100.0,
            y1: 60.0,
        };
        let middle = BBox {
            x0: 0.0,
            y0: 300.0,
            x1: 100.0,
            y1: 350.0,
        };
        assert_eq!(classify_region(&binary, &top, 600.0), BlockType::Header);
        assert_eq!(classify_region(&binary, &middle, 600.0), BlockType::Body);
        // An inkless bottom region is a footer, not handwriting.
        let empty_bottom = BBox {
            x0: 0.0,
            y0: 500.0,
            x1: 100.0,
            y1: 550.0,
        };
        assert_eq!(classify_region(&binary, &empty_bottom, 600.0), BlockType::Footer);
    }

    #[test]
    fn ink_density_measures_coverage() {
        let mut binary = GrayImage::from_pixel(100, 100, Luma([0]));
        for y in 0..10u32 {
            for x in 0..10 {
                binary.put_pixel(x, y, Luma([255]));
            }
        }
        let full = BBox {
            x0: 0.0,
            y0: 0.0,
            x1: 10.0,
            y1: 10.0,
        };
        assert!((ink_density(&binary, &full) - 1.0).abs() < 1e-6);
        let wider = BBox {
            x0: 0.0,
            y0: 0.0,
            x1: 20.0,
            y1: 10.0,
        };
        assert!((ink_density(&binary, &wider) - 0.5).abs() < 1e-6);
        let degenerate = BBox {
            x0: 5.0,
            y0: 5.0,
            x1: 5.0,
            y1: 5.0,
        };
        assert_eq!(ink_density(&binary, &degenerate), 0.0);
    }
}
