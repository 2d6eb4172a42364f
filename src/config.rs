use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Ambiguous numeric dates (`03/04/2024`) are resolved by this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    DayFirst,
    MonthFirst,
}

/// Every tunable of the pipeline, with conservative defaults. Feature
/// flags default to off except the two preprocessing features.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Target rendering density for PDF pages.
    pub raster_dpi: u32,
    /// Pages are downscaled so `max(w, h)` stays under this.
    pub max_long_edge_px: u32,

    pub feature_dewarp: bool,
    pub feature_dual_path_preproc: bool,
    pub feature_donut_fallback: bool,
    pub feature_llm_extraction: bool,
    pub feature_htr: bool,
    pub feature_templates: bool,

    /// Blocks under this confidence take the 0.5 field penalty.
    pub conf_field_min: f32,
    /// Pages under this mean confidence take the 0.7 page penalty.
    pub conf_page_min: f32,
    /// Per-page fallback gate.
    pub conf_fallback_page: f32,
    /// Overall fallback gate.
    pub conf_fallback_overall: f32,
    /// Below this, table reconstruction is skipped for the page.
    pub min_usable_ocr_confidence: f32,

    /// Relative error tolerated between computed and extracted totals.
    pub llm_validation_error_threshold: f64,
    pub llm_timeout_seconds: u64,
    pub llm_max_retries: u32,

    pub htr_confidence_threshold: f32,

    /// Root under which `<slug>/` artifact directories are created.
    pub artifact_root: PathBuf,
    /// Supplier templates JSON, read when `feature_templates` is on.
    pub template_path: Option<PathBuf>,

    pub date_order: DateOrder,
    /// Map independent pages in parallel. Page order in the manifest is
    /// preserved either way.
    pub parallel_pages: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raster_dpi: 200,
            max_long_edge_px: 2200,
            feature_dewarp: true,
            feature_dual_path_preproc: true,
            feature_donut_fallback: false,
            feature_llm_extraction: false,
            feature_htr: false,
            feature_templates: false,
            conf_field_min: 0.55,
            conf_page_min: 0.60,
            conf_fallback_page: 0.45,
            conf_fallback_overall: 0.50,
            min_usable_ocr_confidence: 0.25,
            llm_validation_error_threshold: 0.10,
            llm_timeout_seconds: 120,
            llm_max_retries: 3,
            htr_confidence_threshold: 0.7,
            artifact_root: default_artifact_root(),
            template_path: None,
            date_order: DateOrder::DayFirst,
            parallel_pages: false,
        }
    }
}

fn default_artifact_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ledgerlens")
        .join("uploads")
}
