//! Supplier template matching. Templates are small JSON descriptions of
//! known suppliers; the concatenated document text is scored against each
//! and a confident winner is recorded on the invoice card (and biases the
//! field parsers with a known supplier).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const MIN_MATCH_SCORE: f32 = 50.0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupplierTemplate {
    pub supplier: String,
    #[serde(default)]
    pub logo_hint: Option<String>,
    #[serde(default)]
    pub invoice_no: Vec<String>,
    #[serde(default)]
    pub date: Vec<String>,
    #[serde(default)]
    pub table_headers: Vec<String>,
    #[serde(default)]
    pub currency: Vec<String>,
}

pub fn load_templates(path: &Path) -> anyhow::Result<Vec<SupplierTemplate>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading supplier templates from {}", path.display()))?;
    serde_json::from_slice(&bytes).context("parsing supplier templates")
}

/// Score every template against the page text; the best score above the
/// floor wins.
pub fn match_supplier<'a>(
    page_text: &str,
    templates: &'a [SupplierTemplate],
) -> Option<&'a SupplierTemplate> {
    let lower = page_text.to_lowercase();
    let mut best: Option<(&SupplierTemplate, f32)> = None;

    for template in templates {
        let mut score = 0.0f32;
        let mut matches = 0usize;

        if let Some(hint) = &template.logo_hint {
            if !hint.is_empty() && lower.contains(&hint.to_lowercase()) {
                score += 30.0;
                matches += 1;
            }
        }
        if template
            .invoice_no
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            score += 20.0;
            matches += 1;
        }
        if template
            .date
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            score += 15.0;
            matches += 1;
        }
        for header in &template.table_headers {
            if lower.contains(&header.to_lowercase()) {
                score += 10.0;
                matches += 1;
            }
        }
        // Currency marks are case-significant ("GBP" vs "gbp", "£").
        if template.currency.iter().any(|c| page_text.contains(c)) {
            score += 15.0;
            matches += 1;
        }

        if matches > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((template, score));
        }
    }

    best.filter(|(_, score)| *score > MIN_MATCH_SCORE)
        .map(|(template, _)| template)
}
