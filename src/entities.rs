use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PageIndex = usize;

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Partial,
    NeedsReview,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Header,
    Body,
    Table,
    Footer,
    Handwriting,
}

/// Which detector produced a layout block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Primary,
    Fallback,
    Degenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    Primary,
    Secondary,
    Degenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocPath {
    Minimal,
    Enhanced,
}

/// Which table-reconstruction strategy produced a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Geometric,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Currency {
    #[serde(rename = "GBP")]
    Gbp,
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '£' => Some(Currency::Gbp),
            '€' => Some(Currency::Eur),
            '$' => Some(Currency::Usd),
            _ => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "GBP" => Some(Currency::Gbp),
            "EUR" => Some(Currency::Eur),
            "USD" => Some(Currency::Usd),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Gbp => "GBP",
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A monetary value. Normalized to minor units (e.g. pence) when the
/// document currency is known; otherwise the raw decimal capture is kept.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Amount {
    Minor { minor: i64, currency: Currency },
    Raw(String),
}

impl Amount {
    /// Parse a captured digit group (`1,234.56`, `£45.00`, `45`) into an
    /// amount, normalizing to minor units when the currency is known.
    pub fn from_capture(raw: &str, currency: Option<Currency>) -> Option<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
            return None;
        }
        let value: f64 = cleaned.parse().ok()?;
        Some(match currency {
            Some(currency) => Amount::Minor {
                minor: (value * 100.0).round() as i64,
                currency,
            },
            None => Amount::Raw(cleaned),
        })
    }

    pub fn from_major(value: f64, currency: Option<Currency>) -> Self {
        match currency {
            Some(currency) => Amount::Minor {
                minor: (value * 100.0).round() as i64,
                currency,
            },
            None => Amount::Raw(format!("{value:.2}")),
        }
    }

    /// Value in major units, best effort for raw captures.
    pub fn major(&self) -> Option<f64> {
        match self {
            Amount::Minor { minor, .. } => Some(*minor as f64 / 100.0),
            Amount::Raw(s) => s.parse().ok(),
        }
    }

    pub fn currency(&self) -> Option<Currency> {
        match self {
            Amount::Minor { currency, .. } => Some(*currency),
            Amount::Raw(_) => None,
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.major() {
            Some(v) => write!(f, "{v:.2}"),
            None => match self {
                Amount::Raw(s) => f.write_str(s),
                Amount::Minor { minor, .. } => write!(f, "{minor}"),
            },
        }
    }
}

/// Axis-aligned bounding box in image pixels, `(x0, y0)` top-left.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x0: x,
            y0: y,
            x1: x + w,
            y1: y + h,
        }
    }

    pub fn to_xywh(&self) -> [i32; 4] {
        [
            self.x0.round() as i32,
            self.y0.round() as i32,
            self.width().round() as i32,
            self.height().round() as i32,
        ]
    }

    #[inline(always)]
    pub fn center(&self) -> (f32, f32) {
        (
            self.x0 + self.width() / 2f32,
            self.y0 + self.height() / 2f32,
        )
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    #[inline(always)]
    pub fn area(&self) -> f32 {
        self.height() * self.width()
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0f32 || self.height() <= 0f32
    }

    #[inline(always)]
    pub fn merge(&mut self, other: &Self) {
        self.x0 = self.x0.min(other.x0);
        self.y0 = self.y0.min(other.y0);
        self.x1 = self.x1.max(other.x1);
        self.y1 = self.y1.max(other.y1);
    }

    #[inline(always)]
    fn overlap_x(&self, other: &Self) -> f32 {
        f32::max(
            0f32,
            f32::min(self.x1, other.x1) - f32::max(self.x0, other.x0),
        )
    }

    #[inline(always)]
    fn overlap_y(&self, other: &Self) -> f32 {
        f32::max(
            0f32,
            f32::min(self.y1, other.y1) - f32::max(self.y0, other.y0),
        )
    }

    #[inline(always)]
    pub fn contains(&self, other: &Self) -> bool {
        other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1
    }

    #[inline(always)]
    pub fn intersection(&self, other: &Self) -> f32 {
        self.overlap_x(other) * self.overlap_y(other)
    }

    #[inline(always)]
    fn union(&self, other: &Self) -> f32 {
        other.area() + self.area() - self.intersection(other)
    }

    #[inline(always)]
    pub fn iou(&self, other: &Self) -> f32 {
        self.intersection(other) / self.union(other)
    }

    /// Intersection over the smaller area. More forgiving than IoU when one
    /// box is contained in the other.
    #[inline(always)]
    pub fn relaxed_iou(&self, other: &Self) -> f32 {
        let a = self.intersection(other);
        let b = self.area().min(other.area());
        a / b
    }

    /// Clamp this box to the page rectangle `[0, width) x [0, height)`.
    pub fn clamp_to(&self, page_width: f32, page_height: f32) -> Self {
        Self {
            x0: self.x0.clamp(0f32, page_width),
            y0: self.y0.clamp(0f32, page_height),
            x1: self.x1.clamp(0f32, page_width),
            y1: self.y1.clamp(0f32, page_height),
        }
    }
}

/// Serialize a `BBox` as the `[x, y, w, h]` array used by the JSON
/// artifacts.
pub mod bbox_xywh {
    use super::BBox;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bbox: &BBox, ser: S) -> Result<S::Ok, S::Error> {
        bbox.to_xywh().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BBox, D::Error> {
        let [x, y, w, h] = <[i32; 4]>::deserialize(de)?;
        Ok(BBox::from_xywh(x as f32, y as f32, w as f32, h as f32))
    }
}

/// Input envelope. Owns its rasterized pages for the lifetime of a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Document {
    pub doc_id: Uuid,
    pub source_path: PathBuf,
    pub mime: String,
    pub page_count: usize,
    pub slug: String,
}

impl Document {
    pub fn new(source_path: &Path, mime: &str, page_count: usize) -> Self {
        Self {
            doc_id: Uuid::new_v4(),
            source_path: source_path.to_owned(),
            mime: mime.to_owned(),
            page_count,
            slug: slugify(source_path),
        }
    }
}

/// Filename stem, lowercased, spaces replaced with underscores.
pub fn slugify(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_lowercase()
        .replace(' ', "_")
}

/// One rendered page. The decoded raster travels in memory alongside its
/// on-disk path; it is never serialized.
#[derive(Debug, Deserialize, Serialize)]
pub struct RasterPage {
    pub page_index: PageIndex,
    pub width_px: u32,
    pub height_px: u32,
    pub density_dpi: u32,
    pub image_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub image: DynamicImage,
}

/// Side-by-side metrics of the dual-path preprocessing comparison.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathComparison {
    pub minimal_confidence: f32,
    pub enhanced_confidence: f32,
    pub minimal_words: usize,
    pub enhanced_words: usize,
    pub reason: String,
}

/// Append-only trace of the transformations applied to a page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreprocMeta {
    pub path: PreprocPath,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<PathComparison>,
}

impl PreprocMeta {
    pub fn new(path: PreprocPath) -> Self {
        Self {
            path,
            steps: Vec::new(),
            warnings: Vec::new(),
            comparison: None,
        }
    }

    pub fn step(&mut self, step: impl Into<String>) {
        self.steps.push(step.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// A typed rectangular region of interest on a page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayoutBlock {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(with = "bbox_xywh")]
    pub bbox: BBox,
    pub confidence: f32,
    pub source: BlockSource,
}

/// Layout result for one page, serialized as `layout_page_NNN.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageLayout {
    pub page_num: PageIndex,
    pub blocks: Vec<LayoutBlock>,
    pub method_used: String,
    pub confidence_avg: f32,
    pub processing_time: f64,
}

impl PageLayout {
    pub fn new(page_num: PageIndex, blocks: Vec<LayoutBlock>, method_used: &str) -> Self {
        let confidence_avg = mean_confidence(blocks.iter().map(|b| b.confidence));
        Self {
            page_num,
            blocks,
            method_used: method_used.to_owned(),
            confidence_avg,
            processing_time: 0.0,
        }
    }
}

/// Mean of an iterator of confidences, `0` when empty.
pub fn mean_confidence(values: impl Iterator<Item = f32>) -> f32 {
    let mut sum = 0f32;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0f32
    } else {
        sum / n as f32
    }
}

/// One recognized word with its geometry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WordBox {
    pub text: String,
    #[serde(with = "bbox_xywh")]
    pub bbox: BBox,
    pub confidence: f32,
}

/// OCR result for one block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockOcr {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(with = "bbox_xywh")]
    pub bbox: BBox,
    pub ocr_text: String,
    pub confidence: f32,
    pub method_used: OcrMethod,
    pub processing_time: f64,
    pub field_count: usize,
    pub line_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_blocks: Option<Vec<WordBox>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psm_hint: Option<String>,
    pub dropped_words: usize,
    /// Confidence of the layout block this OCR ran on. Internal; the
    /// artifact shape carries only the OCR confidence.
    #[serde(skip)]
    pub layout_confidence: f32,
}

/// Per-page OCR artifact, serialized as `ocr_page_NNN.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageOcr {
    pub page_num: PageIndex,
    pub blocks: Vec<BlockOcr>,
    pub processing_time: f64,
    pub method_used: OcrMethod,
    pub confidence_avg: f32,
    pub low_confidence_blocks: usize,
    pub preprocessing_path: PreprocPath,
    pub errors: Vec<String>,
}

/// One row of a reconstructed table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<Amount>,
    pub line_total: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vat: Option<Amount>,
    pub confidence: f32,
    pub row_index: usize,
    pub provenance: Provenance,
}

/// Per-table-block extraction result.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableResult {
    #[serde(with = "bbox_xywh")]
    pub bbox: BBox,
    pub line_items: Vec<LineItem>,
    pub method_used: Provenance,
    pub confidence: f32,
    pub fallback_used: bool,
    pub cell_count: usize,
    pub row_count: usize,
}

impl TableResult {
    /// Confidence is capped by both the layout block's confidence and the
    /// mean item confidence.
    pub fn capped_confidence(block_confidence: f32, line_items: &[LineItem]) -> f32 {
        let item_mean = mean_confidence(line_items.iter().map(|i| i.confidence));
        block_confidence.min(item_mean)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtrBlock {
    #[serde(with = "bbox_xywh")]
    pub bbox: BBox,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtrData {
    pub blocks: Vec<HtrBlock>,
    pub review_candidates: usize,
}

/// Union of layout + OCR + tables for a single page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageResult {
    pub page_num: PageIndex,
    pub blocks: Vec<BlockOcr>,
    pub confidence: f32,
    pub preprocessing: PreprocMeta,
    pub tables: Vec<TableResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donut_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htr_data: Option<HtrData>,
    pub errors: Vec<String>,
}

impl PageResult {
    pub fn line_items(&self) -> impl Iterator<Item = &LineItem> {
        self.tables.iter().flat_map(|t| t.line_items.iter())
    }
}

/// The validated output of a run. Never mutated after emission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceCard {
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub currency: Option<Currency>,
    pub subtotal: Option<Amount>,
    pub tax_amount: Option<Amount>,
    pub total_amount: Option<Amount>,
    pub line_items: Vec<LineItem>,
    pub overall_confidence: f32,
    pub status: Status,
    pub validation_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_match: Option<String>,
}

/// Raw output of a fallback engine, kept for the manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackTrace {
    pub engine: String,
    pub raw: serde_json::Value,
    pub merged: bool,
}

/// The single-file pipeline manifest, serialized as `ocr_output.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanReport {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    pub pages: Vec<PageResult>,
    pub overall_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<InvoiceCard>,
    pub artifact_dir: String,
    pub elapsed_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanReport {
    pub fn input_error(error: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            document: None,
            pages: Vec::new(),
            overall_confidence: 0.0,
            invoice: None,
            artifact_dir: String::new(),
            elapsed_sec: 0.0,
            fallback: None,
            error: Some(error.into()),
        }
    }
}
