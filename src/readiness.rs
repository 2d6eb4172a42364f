//! Deterministic readiness probe. The pipeline refuses to start when a
//! required component is missing; optional engines are reported but never
//! block.

use serde::Serialize;

use crate::engines::EngineBundle;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: &'static str,
    pub available: bool,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub components: Vec<ComponentStatus>,
    pub missing_required: Vec<&'static str>,
}

pub fn probe(engines: &EngineBundle) -> ReadinessReport {
    let mut components = Vec::new();

    let pdfium = crate::raster::bind_pdfium();
    components.push(ComponentStatus {
        name: "pdf_renderer",
        available: pdfium.is_ok(),
        required: true,
        detail: pdfium.err().map(|e| e.to_string()),
    });

    // Image codecs are compiled in.
    components.push(ComponentStatus {
        name: "image_codecs",
        available: true,
        required: true,
        detail: None,
    });

    components.push(ComponentStatus {
        name: "ocr_engine",
        available: engines.has_ocr_engine(),
        required: true,
        detail: (!engines.has_ocr_engine())
            .then(|| "neither a primary nor a secondary recognizer is configured".to_owned()),
    });

    for (name, available) in [
        ("layout_model", engines.layout.is_some()),
        ("donut_fallback", engines.donut.is_some()),
        ("llm_normalizer", engines.llm.is_some()),
        ("htr_engine", engines.htr.is_some()),
    ] {
        components.push(ComponentStatus {
            name,
            available,
            required: false,
            detail: None,
        });
    }

    let missing_required: Vec<&'static str> = components
        .iter()
        .filter(|c| c.required && !c.available)
        .map(|c| c.name)
        .collect();

    ReadinessReport {
        ready: missing_required.is_empty(),
        components,
        missing_required,
    }
}
