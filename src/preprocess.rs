//! Page preprocessing.
//!
//! Two independent paths produce a cleaned grayscale image per page:
//! *enhanced* (dewarp, deskew, bilateral denoise, CLAHE) for photographs
//! and rough scans, *minimal* (downscale + light bilateral) for clean
//! born-digital pages. The comparator OCRs both full pages and keeps the
//! better result. Output stays grayscale; binarization would cost the
//! downstream deep-learning recognizers their anti-aliasing.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::contrast::adaptive_threshold;
use imageproc::edges::canny;
use imageproc::filter::{bilateral_filter, laplacian_filter};
use imageproc::geometric_transformations::{rotate_about_center, warp, Interpolation, Projection};
use imageproc::geometry::approximate_polygon_dp;
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::point::Point;
use tracing::instrument;

use crate::entities::{PathComparison, PreprocMeta, PreprocPath};

/// Skew below this is left alone.
const DESKEW_MIN_ANGLE_RAD: f32 = 0.1;
/// A document quad must cover at least this share of the image.
const DEWARP_MIN_AREA_RATIO: f64 = 0.3;
/// Confidence band inside which the comparator falls through to word
/// counts.
const COMPARE_CONF_BAND: f32 = 0.05;
/// Word-count band inside which minimal wins on speed.
const COMPARE_WORD_BAND: f64 = 0.10;

const LAPLACIAN_VARIANCE_PHOTO: f64 = 250.0;
const GRAY_STDDEV_PHOTO: f64 = 55.0;
const COLOR_STDDEV_PHOTO: f64 = 40.0;

#[derive(Debug)]
pub struct PreprocResult {
    pub image: GrayImage,
    pub meta: PreprocMeta,
}

/// OCR probe used by the comparator: full-page mean confidence and word
/// count for a candidate image.
pub type OcrProbe<'a> = dyn Fn(&GrayImage) -> Option<(f32, usize)> + 'a;

/// Run the configured preprocessing for one page. With dual-path enabled
/// and a usable probe, both paths are OCR'd and the better one wins;
/// otherwise the enhanced path is used directly.
#[instrument(skip_all)]
pub fn preprocess_page(
    page: &DynamicImage,
    max_long_edge: u32,
    dewarp_enabled: bool,
    dual_path: bool,
    probe: &OcrProbe,
) -> PreprocResult {
    if !dual_path {
        return enhanced_path(page, max_long_edge, dewarp_enabled);
    }

    let minimal = minimal_path(page, max_long_edge);
    let enhanced = enhanced_path(page, max_long_edge, dewarp_enabled);

    let (minimal_metrics, enhanced_metrics) = (probe(&minimal.image), probe(&enhanced.image));
    let (Some((min_conf, min_words)), Some((enh_conf, enh_words))) =
        (minimal_metrics, enhanced_metrics)
    else {
        let mut chosen = enhanced;
        chosen
            .meta
            .warn("dual_path_probe_unavailable, defaulting to enhanced");
        return chosen;
    };

    let (path, reason) = choose_path(min_conf, min_words, enh_conf, enh_words);
    let mut chosen = match path {
        PreprocPath::Minimal => minimal,
        PreprocPath::Enhanced => enhanced,
    };
    chosen.meta.comparison = Some(PathComparison {
        minimal_confidence: min_conf,
        enhanced_confidence: enh_conf,
        minimal_words: min_words,
        enhanced_words: enh_words,
        reason,
    });
    tracing::debug!(path = ?chosen.meta.path, "dual-path preprocessing decision");
    chosen
}

/// The comparator decision. Minimal wins on higher confidence, on more
/// words inside the confidence band, or on similar words inside the band
/// (it is the faster path); everything else goes to enhanced.
pub fn choose_path(
    min_conf: f32,
    min_words: usize,
    enh_conf: f32,
    enh_words: usize,
) -> (PreprocPath, String) {
    let conf_diff = min_conf - enh_conf;
    if min_conf > enh_conf {
        return (
            PreprocPath::Minimal,
            format!("higher confidence ({min_conf:.3} vs {enh_conf:.3})"),
        );
    }
    if conf_diff.abs() <= COMPARE_CONF_BAND {
        if min_words > enh_words {
            return (
                PreprocPath::Minimal,
                format!(
                    "similar confidence ({min_conf:.3} vs {enh_conf:.3}) but more words ({min_words} vs {enh_words})"
                ),
            );
        }
        let word_band = min_words.max(enh_words) as f64 * COMPARE_WORD_BAND;
        if (min_words as f64 - enh_words as f64).abs() <= word_band {
            return (
                PreprocPath::Minimal,
                "similar results, preferring minimal (faster)".to_owned(),
            );
        }
    }
    (
        PreprocPath::Enhanced,
        format!("enhanced better (conf {enh_conf:.3} vs {min_conf:.3}, words {enh_words} vs {min_words})"),
    )
}

/// Downscale + grayscale + one gentle bilateral pass.
pub fn minimal_path(page: &DynamicImage, max_long_edge: u32) -> PreprocResult {
    let mut meta = PreprocMeta::new(PreprocPath::Minimal);
    let scaled = downscale(page, max_long_edge, &mut meta);
    let gray = scaled.to_luma8();
    meta.step("to_gray");
    let denoised = bilateral_filter(&gray, 5, 50.0, 50.0);
    meta.step("bilateral_light");
    PreprocResult {
        image: denoised,
        meta,
    }
}

/// Full enhancement: dewarp for photographs, deskew, bilateral, CLAHE.
pub fn enhanced_path(page: &DynamicImage, max_long_edge: u32, dewarp_enabled: bool) -> PreprocResult {
    let mut meta = PreprocMeta::new(PreprocPath::Enhanced);
    let scaled = downscale(page, max_long_edge, &mut meta);
    let mut gray = scaled.to_luma8();
    meta.step("to_gray");

    if dewarp_enabled && is_photo(&scaled, &gray) {
        match dewarp(&gray) {
            Some(warped) => {
                gray = warped;
                meta.step("dewarp_perspective_correction");
            }
            None => meta.warn("dewarp: no document quad found"),
        }
    }

    let angle_deg = deskew_angle(&gray);
    meta.step(format!("deskew:{angle_deg:.2}"));
    if angle_deg.to_radians().abs() > DESKEW_MIN_ANGLE_RAD {
        gray = rotate_about_center(
            &gray,
            -angle_deg.to_radians(),
            Interpolation::Bilinear,
            Luma([255u8]),
        );
    }

    gray = bilateral_filter(&gray, 5, 75.0, 75.0);
    meta.step("bilateral");

    gray = clahe(&gray, 2.0, 8);
    meta.step("clahe");

    PreprocResult { image: gray, meta }
}

fn downscale(page: &DynamicImage, max_long_edge: u32, meta: &mut PreprocMeta) -> DynamicImage {
    let long_edge = page.width().max(page.height());
    if long_edge <= max_long_edge {
        return page.clone();
    }
    let scale = max_long_edge as f32 / long_edge as f32;
    let (w, h) = (
        (page.width() as f32 * scale).round().max(1.0) as u32,
        (page.height() as f32 * scale).round().max(1.0) as u32,
    );
    meta.step(format!("downscale:{w}x{h}"));
    page.resize_exact(w, h, FilterType::Triangle)
}

/// Photographs respond badly to the gentle path: soft edges (low
/// Laplacian variance), lighting gradients (high grayscale deviation) or
/// strong per-channel deviation on color inputs all point at a photo.
fn is_photo(color: &DynamicImage, gray: &GrayImage) -> bool {
    if color.color().has_color() {
        let rgb = color.to_rgb8();
        let mut channel_std = [0f64; 3];
        for c in 0..3 {
            channel_std[c] = std_dev(rgb.pixels().map(|p| p.0[c] as f64));
        }
        let color_variance = channel_std.iter().sum::<f64>() / 3.0;
        if color_variance > COLOR_STDDEV_PHOTO {
            return true;
        }
    }

    let lap = laplacian_filter(gray);
    let lap_var = variance(lap.pixels().map(|p| p.0[0] as f64));
    let gray_std = std_dev(gray.pixels().map(|p| p.0[0] as f64));
    lap_var < LAPLACIAN_VARIANCE_PHOTO || gray_std > GRAY_STDDEV_PHOTO
}

fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let (mut sum, mut n) = (0f64, 0f64);
    for v in values.clone() {
        sum += v;
        n += 1.0;
    }
    if n == 0.0 {
        return 0.0;
    }
    let mean = sum / n;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn std_dev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    variance(values).sqrt()
}

/// Perspective correction: find the largest 4-sided polygon covering at
/// least 30% of the image and warp it onto an axis-aligned rectangle
/// sized by the longest detected sides.
fn dewarp(gray: &GrayImage) -> Option<GrayImage> {
    let (w, h) = gray.dimensions();
    let image_area = (w as f64) * (h as f64);

    let binary = adaptive_threshold(gray, 15);
    let contours = find_contours::<i32>(&binary);

    let mut best: Option<(f64, [Point<f32>; 4])> = None;
    for contour in &contours {
        if contour.points.len() < 4 {
            continue;
        }
        let area = polygon_area(&contour.points);
        if area < image_area * DEWARP_MIN_AREA_RATIO {
            continue;
        }
        let epsilon = 0.02 * polygon_perimeter(&contour.points);
        let approx = approximate_polygon_dp(&contour.points, epsilon, true);
        if approx.len() != 4 {
            continue;
        }
        let quad = [
            Point::new(approx[0].x as f32, approx[0].y as f32),
            Point::new(approx[1].x as f32, approx[1].y as f32),
            Point::new(approx[2].x as f32, approx[2].y as f32),
            Point::new(approx[3].x as f32, approx[3].y as f32),
        ];
        if best.as_ref().map(|(a, _)| area > *a).unwrap_or(true) {
            best = Some((area, quad));
        }
    }

    let (_, quad) = best?;
    let [tl, tr, br, bl] = order_quad(quad);

    let width_a = distance(&br, &bl);
    let width_b = distance(&tr, &tl);
    let max_w = width_a.max(width_b).round().max(1.0) as u32;
    let height_a = distance(&tr, &br);
    let height_b = distance(&tl, &bl);
    let max_h = height_a.max(height_b).round().max(1.0) as u32;

    let projection = Projection::from_control_points(
        [(tl.x, tl.y), (tr.x, tr.y), (br.x, br.y), (bl.x, bl.y)],
        [
            (0.0, 0.0),
            (max_w as f32 - 1.0, 0.0),
            (max_w as f32 - 1.0, max_h as f32 - 1.0),
            (0.0, max_h as f32 - 1.0),
        ],
    )?;

    let warped = warp(gray, &projection, Interpolation::Bilinear, Luma([255u8]));
    let crop_w = max_w.min(warped.width());
    let crop_h = max_h.min(warped.height());
    Some(image::imageops::crop_imm(&warped, 0, 0, crop_w, crop_h).to_image())
}

/// Order as top-left, top-right, bottom-right, bottom-left.
fn order_quad(mut points: [Point<f32>; 4]) -> [Point<f32>; 4] {
    points.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
    let (mut left, right) = ([points[0], points[1]], [points[2], points[3]]);
    if left[0].y > left[1].y {
        left.swap(0, 1);
    }
    let (tl, bl) = (left[0], left[1]);
    // The right point farthest from the top-left corner is the bottom-right.
    let (tr, br) = if distance(&tl, &right[0]) > distance(&tl, &right[1]) {
        (right[1], right[0])
    } else {
        (right[0], right[1])
    };
    [tl, tr, br, bl]
}

fn distance(a: &Point<f32>, b: &Point<f32>) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0f64;
    for i in 0..points.len() {
        let a = &points[i];
        let b = &points[(i + 1) % points.len()];
        acc += (a.x as f64) * (b.y as f64) - (b.x as f64) * (a.y as f64);
    }
    acc.abs() / 2.0
}

fn polygon_perimeter(points: &[Point<i32>]) -> f64 {
    let mut acc = 0f64;
    for i in 0..points.len() {
        let a = &points[i];
        let b = &points[(i + 1) % points.len()];
        acc += (((a.x - b.x).pow(2) + (a.y - b.y).pow(2)) as f64).sqrt();
    }
    acc
}

/// Median skew angle in degrees from Hough lines, near-horizontal lines
/// only.
fn deskew_angle(gray: &GrayImage) -> f32 {
    let edges = canny(gray, 50.0, 150.0);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: 140,
            suppression_radius: 8,
        },
    );
    let mut angles: Vec<f32> = lines
        .iter()
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .filter(|a| (-45.0..=45.0).contains(a))
        .collect();
    if angles.is_empty() {
        return 0.0;
    }
    angles.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    angles[angles.len() / 2]
}

/// Contrast-limited adaptive histogram equalization over a `tiles`×`tiles`
/// grid with bilinear blending between tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w < tiles || h < tiles {
        return gray.clone();
    }
    let tile_w = w.div_ceil(tiles);
    let tile_h = h.div_ceil(tiles);

    // Per-tile clipped-histogram lookup tables.
    let mut luts = vec![[0u8; 256]; (tiles * tiles) as usize];
    for ty in 0..tiles {
        for tx in 0..tiles {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }

            let clip = ((clip_limit * count as f32) / 256.0).max(1.0) as u32;
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redistribute = excess / 256;
            for bin in hist.iter_mut() {
                *bin += redistribute;
            }

            let lut = &mut luts[(ty * tiles + tx) as usize];
            let mut cdf = 0u64;
            for (value, bin) in hist.iter().enumerate() {
                cdf += *bin as u64;
                lut[value] = ((cdf * 255) / count as u64).min(255) as u8;
            }
        }
    }

    // Bilinear interpolation between the four surrounding tile LUTs.
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let value = gray.get_pixel(x, y).0[0] as usize;

            let fx = (x as f32 / tile_w as f32) - 0.5;
            let fy = (y as f32 / tile_h as f32) - 0.5;
            let tx0 = fx.floor().max(0.0) as u32;
            let ty0 = fy.floor().max(0.0) as u32;
            let tx1 = (tx0 + 1).min(tiles - 1);
            let ty1 = (ty0 + 1).min(tiles - 1);
            let wx = (fx - fx.floor()).clamp(0.0, 1.0);
            let wy = (fy - fy.floor()).clamp(0.0, 1.0);

            let lookup = |tx: u32, ty: u32| luts[(ty * tiles + tx) as usize][value] as f32;
            let top = lookup(tx0, ty0) * (1.0 - wx) + lookup(tx1, ty0) * wx;
            let bottom = lookup(tx0, ty1) * (1.0 - wx) + lookup(tx1, ty1) * wx;
            let blended = top * (1.0 - wy) + bottom * wy;
            out.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_page(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(w, h, Luma([value])))
    }

    #[test]
    fn downscale_caps_long_edge() {
        let page = flat_page(300, 200, 255);
        let result = minimal_path(&page, 150);
        assert_eq!(result.image.width(), 150);
        assert_eq!(result.image.height(), 100);
        assert!(result.meta.steps.iter().any(|s| s.starts_with("downscale:")));
    }

    #[test]
    fn small_pages_are_not_upscaled() {
        let page = flat_page(300, 200, 255);
        let result = minimal_path(&page, 2200);
        assert_eq!(result.image.dimensions(), (300, 200));
        assert!(!result.meta.steps.iter().any(|s| s.starts_with("downscale:")));
    }

    #[test]
    fn minimal_meta_records_path_and_steps() {
        let result = minimal_path(&flat_page(100, 100, 200), 2200);
        assert_eq!(result.meta.path, PreprocPath::Minimal);
        assert_eq!(result.meta.steps, vec!["to_gray", "bilateral_light"]);
    }

    #[test]
    fn enhanced_meta_records_deskew_and_clahe() {
        let result = enhanced_path(&flat_page(120, 120, 255), 2200, false);
        assert_eq!(result.meta.path, PreprocPath::Enhanced);
        assert!(result.meta.steps.iter().any(|s| s.starts_with("deskew:")));
        assert!(result.meta.steps.iter().any(|s| s == "clahe"));
        assert!(result.meta.steps.iter().any(|s| s == "bilateral"));
    }

    #[test]
    fn comparator_prefers_higher_confidence() {
        let (path, _) = choose_path(0.9, 10, 0.7, 40);
        assert_eq!(path, PreprocPath::Minimal);
        let (path, _) = choose_path(0.5, 100, 0.9, 40);
        assert_eq!(path, PreprocPath::Enhanced);
    }

    #[test]
    fn comparator_breaks_ties_by_word_count() {
        let (path, reason) = choose_path(0.80, 60, 0.83, 40);
        assert_eq!(path, PreprocPath::Minimal);
        assert!(reason.contains("more words"));
    }

    #[test]
    fn comparator_prefers_minimal_when_similar() {
        // Confidence within 5%, word counts within 10% of each other.
        let (path, reason) = choose_path(0.80, 40, 0.83, 42);
        assert_eq!(path, PreprocPath::Minimal);
        assert!(reason.contains("faster"));
    }

    #[test]
    fn dual_path_records_comparison() {
        let page = flat_page(64, 64, 230);
        let result = preprocess_page(&page, 2200, false, true, &|_| Some((0.8, 12)));
        assert!(result.meta.comparison.is_some());
        // Equal metrics land in the "similar results" minimal branch.
        assert_eq!(result.meta.path, PreprocPath::Minimal);
    }

    #[test]
    fn dual_path_without_probe_falls_back_to_enhanced() {
        let page = flat_page(64, 64, 230);
        let result = preprocess_page(&page, 2200, false, true, &|_| None);
        assert_eq!(result.meta.path, PreprocPath::Enhanced);
        assert!(result
            .meta
            .warnings
            .iter()
            .any(|w| w.contains("probe_unavailable")));
    }

    #[test]
    fn clahe_preserves_dimensions_and_spreads_contrast() {
        let mut img = GrayImage::from_pixel(64, 64, Luma([120]));
        for y in 0..64 {
            for x in 0..32 {
                img.put_pixel(x, y, Luma([100]));
            }
        }
        let out = clahe(&img, 2.0, 8);
        assert_eq!(out.dimensions(), (64, 64));
    }

    #[test]
    fn order_quad_orients_corners() {
        let quad = [
            Point::new(90.0, 10.0),
            Point::new(10.0, 12.0),
            Point::new(92.0, 80.0),
            Point::new(8.0, 82.0),
        ];
        let [tl, tr, br, bl] = order_quad(quad);
        assert!(tl.x < tr.x && tl.y < bl.y);
        assert!(br.x > bl.x && br.y > tr.y);
    }

    #[test]
    fn deskew_angle_zero_on_blank_page() {
        let gray = GrayImage::from_pixel(200, 200, Luma([255]));
        assert_eq!(deskew_angle(&gray), 0.0);
    }
}
