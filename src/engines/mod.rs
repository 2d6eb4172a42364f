//! Capability seams for every heavy model the pipeline consumes.
//!
//! The host constructs the bundle once (engines are process-global
//! singletons, read-only after load) and injects it into the pipeline;
//! nothing here is pulled from a mutable registry.

pub mod adapter;
pub mod command;
pub mod ollama;
pub mod tesseract;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::entities::BBox;

/// Page-segmentation hint handed to the secondary recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsmHint {
    /// Treat the crop as a single text line (headers).
    SingleLine,
    /// Treat the crop as a uniform block of text (tables, body, footers).
    UniformBlock,
}

impl PsmHint {
    pub fn tesseract_mode(&self) -> u8 {
        match self {
            PsmHint::SingleLine => 7,
            PsmHint::UniformBlock => 6,
        }
    }
}

/// Text plus confidence, the common denominator of the simpler engines.
#[derive(Debug, Clone, Default)]
pub struct OcrLines {
    pub text: String,
    pub confidence: f32,
}

/// A raw detection from the layout model, before label mapping and
/// clamping.
#[derive(Debug, Clone)]
pub struct ModelDetection {
    pub label: String,
    pub bbox: BBox,
    pub score: f32,
}

pub trait LayoutModel: Send + Sync {
    fn detect(&self, page: &DynamicImage) -> anyhow::Result<Vec<ModelDetection>>;
}

/// The primary recognizer. Returns its payload as raw JSON because real
/// engines emit heterogeneous structures; `adapter::normalize_payload`
/// turns any of the known shapes into typed word hits.
pub trait PrimaryOcr: Send + Sync {
    fn recognize(&self, image: &GrayImage, orient: bool) -> anyhow::Result<serde_json::Value>;
}

pub trait SecondaryOcr: Send + Sync {
    fn recognize(&self, image: &GrayImage, psm: PsmHint) -> anyhow::Result<OcrLines>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DonutStatus {
    Ok,
    Error,
    Unavailable,
}

/// Donut fallback wire contract: single image in, model-specific text out.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DonutResponse {
    pub status: DonutStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DonutResponse {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            status: DonutStatus::Unavailable,
            text: None,
            model: None,
            error: Some(error.into()),
        }
    }
}

pub trait DonutClient: Send + Sync {
    fn parse(&self, image_path: &Path) -> DonutResponse;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmContext {
    pub region: String,
    pub industry: String,
    pub document_type: String,
}

impl Default for LlmContext {
    fn default() -> Self {
        Self {
            region: "UK".to_owned(),
            industry: "general".to_owned(),
            document_type: "invoice".to_owned(),
        }
    }
}

/// Request for the LLM normalizer: concatenated high-confidence block
/// text, context, and the wall-clock budget the client must honor.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub text: String,
    pub context: LlmContext,
    pub timeout: Duration,
}

pub trait LlmClient: Send + Sync {
    fn normalize(&self, request: &LlmRequest) -> anyhow::Result<serde_json::Value>;
}

/// Handwriting recognition for blocks the layout stage typed as
/// `handwriting`.
pub trait HtrClient: Send + Sync {
    fn transcribe(&self, image: &GrayImage) -> anyhow::Result<OcrLines>;
}

/// The injected set of capabilities. Any slot may be empty; the readiness
/// probe decides whether the pipeline can start.
#[derive(Clone, Default)]
pub struct EngineBundle {
    pub layout: Option<Arc<dyn LayoutModel>>,
    pub primary_ocr: Option<Arc<dyn PrimaryOcr>>,
    pub secondary_ocr: Option<Arc<dyn SecondaryOcr>>,
    pub donut: Option<Arc<dyn DonutClient>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub htr: Option<Arc<dyn HtrClient>>,
}

impl EngineBundle {
    pub fn has_ocr_engine(&self) -> bool {
        self.primary_ocr.is_some() || self.secondary_ocr.is_some()
    }

    pub fn with_layout(mut self, layout: Arc<dyn LayoutModel>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_primary_ocr(mut self, ocr: Arc<dyn PrimaryOcr>) -> Self {
        self.primary_ocr = Some(ocr);
        self
    }

    pub fn with_secondary_ocr(mut self, ocr: Arc<dyn SecondaryOcr>) -> Self {
        self.secondary_ocr = Some(ocr);
        self
    }

    pub fn with_donut(mut self, donut: Arc<dyn DonutClient>) -> Self {
        self.donut = Some(donut);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_htr(mut self, htr: Arc<dyn HtrClient>) -> Self {
        self.htr = Some(htr);
        self
    }
}

impl std::fmt::Debug for EngineBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBundle")
            .field("layout", &self.layout.is_some())
            .field("primary_ocr", &self.primary_ocr.is_some())
            .field("secondary_ocr", &self.secondary_ocr.is_some())
            .field("donut", &self.donut.is_some())
            .field("llm", &self.llm.is_some())
            .field("htr", &self.htr.is_some())
            .finish()
    }
}
