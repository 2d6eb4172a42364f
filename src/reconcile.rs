//! Reconciler & router: assemble the final `InvoiceCard` and decide its
//! status.
//!
//! Field- and page-level confidence penalties are applied first, then the
//! fallback gate may pull in Donut or the LLM normalizer, the merged card
//! is validated against its own arithmetic, and the accumulated
//! degradation becomes `ok | partial | needs_review`.

use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::config::PipelineConfig;
use crate::engines::{DonutStatus, EngineBundle, LlmContext, LlmRequest};
use crate::entities::{
    mean_confidence, Amount, Currency, FallbackTrace, InvoiceCard, LineItem, PageResult,
    Provenance, Status,
};
use crate::errors::StageError;
use crate::fields::HeaderFields;
use crate::llm;

const FIELD_PENALTY: f32 = 0.5;
const PAGE_PENALTY: f32 = 0.7;
/// Blocks below this stay out of the LLM prompt.
const LLM_PROMPT_MIN_CONFIDENCE: f32 = 0.6;
/// Donut does not self-report confidence; this stands in for the merge
/// rule.
const DONUT_SELF_CONFIDENCE: f32 = 0.6;

/// Header/total/line-item values offered by a fallback engine, with the
/// confidence it self-reports.
#[derive(Debug, Clone, Default)]
pub struct FallbackPatch {
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<chrono::NaiveDate>,
    pub currency: Option<Currency>,
    pub subtotal: Option<f64>,
    pub tax_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub lines: Vec<llm::LlmLine>,
    pub confidence: f32,
}

impl From<llm::ValidatedLlm> for FallbackPatch {
    fn from(v: llm::ValidatedLlm) -> Self {
        Self {
            supplier_name: v.supplier_name,
            invoice_number: v.invoice_number,
            invoice_date: v.invoice_date,
            currency: v.currency,
            subtotal: v.subtotal,
            tax_amount: v.tax_amount,
            total_amount: v.total_amount,
            lines: v.lines,
            confidence: v.confidence,
        }
    }
}

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub invoice: InvoiceCard,
    pub pages: Vec<PageResult>,
    pub fallback: Option<FallbackTrace>,
    pub overall_confidence: f32,
}

/// Apply the confidence penalties in place and return the overall
/// confidence (average of per-page confidences).
pub fn apply_penalties(pages: &mut [PageResult], config: &PipelineConfig) -> f32 {
    for page in pages.iter_mut() {
        for block in &mut page.blocks {
            if block.confidence < config.conf_field_min {
                block.confidence *= FIELD_PENALTY;
            }
        }
        let mut page_conf = mean_confidence(page.blocks.iter().map(|b| b.confidence));
        if page_conf < config.conf_page_min {
            page_conf *= PAGE_PENALTY;
        }
        page.confidence = page_conf;
    }
    mean_confidence(pages.iter().map(|p| p.confidence))
}

/// The fallback gate: low page confidence, low overall confidence, or a
/// page that yielded no line items.
pub fn fallback_gate(page: &PageResult, overall: f32, config: &PipelineConfig) -> bool {
    page.confidence < config.conf_fallback_page
        || overall < config.conf_fallback_overall
        || page.line_items().next().is_none()
}

#[instrument(skip_all)]
pub fn reconcile(
    config: &PipelineConfig,
    engines: &EngineBundle,
    fields: HeaderFields,
    mut pages: Vec<PageResult>,
    page_image_paths: &[std::path::PathBuf],
    template_match: Option<String>,
) -> ReconcileOutcome {
    let overall_confidence = apply_penalties(&mut pages, config);

    let gated: Vec<usize> = pages
        .iter()
        .enumerate()
        .filter(|(_, page)| fallback_gate(page, overall_confidence, config))
        .map(|(i, _)| i)
        .collect();

    let mut fallback_trace = None;
    let mut patch: Option<FallbackPatch> = None;

    if !gated.is_empty() {
        if config.feature_donut_fallback && engines.donut.is_some() {
            let (trace, donut_patch) = run_donut(engines, &mut pages, &gated, page_image_paths);
            fallback_trace = trace;
            patch = donut_patch;
        } else if config.feature_llm_extraction && engines.llm.is_some() {
            let (trace, llm_patch) = run_llm(config, engines, &pages);
            fallback_trace = trace;
            patch = llm_patch;
        } else if config.feature_donut_fallback || config.feature_llm_extraction {
            for &i in &gated {
                pages[i].errors.push(
                    StageError::FallbackUnavailable("no fallback engine configured".to_owned())
                        .record(),
                );
            }
        }
    }

    let mut card = assemble_card(&fields, &pages, template_match);
    let mut merged = false;
    if let Some(patch) = patch {
        merged = merge_patch(&mut card, &fields, &patch);
    }
    if let Some(trace) = &mut fallback_trace {
        trace.merged = merged;
    }

    card.overall_confidence = overall_confidence;
    validate_card(&mut card, config, overall_confidence);

    ReconcileOutcome {
        invoice: card,
        pages,
        fallback: fallback_trace,
        overall_confidence,
    }
}

fn run_donut(
    engines: &EngineBundle,
    pages: &mut [PageResult],
    gated: &[usize],
    page_image_paths: &[std::path::PathBuf],
) -> (Option<FallbackTrace>, Option<FallbackPatch>) {
    let donut = engines.donut.as_ref().unwrap();
    let mut trace = None;
    let mut patch = None;

    for &i in gated {
        let Some(path) = page_image_paths.get(i) else {
            continue;
        };
        let response = donut.parse(path);
        let raw = serde_json::to_value(&response).unwrap_or(Value::Null);
        pages[i].donut_data = Some(raw.clone());

        match response.status {
            DonutStatus::Ok => {
                if let Some(text) = &response.text {
                    pages[i].fallback_text = Some(text.clone());
                    if patch.is_none() {
                        patch = adapt_donut_text(text);
                    }
                }
                if trace.is_none() {
                    trace = Some(FallbackTrace {
                        engine: "donut".to_owned(),
                        raw,
                        merged: false,
                    });
                }
            }
            DonutStatus::Error | DonutStatus::Unavailable => {
                pages[i].errors.push(
                    StageError::FallbackUnavailable(
                        response.error.unwrap_or_else(|| "donut failed".to_owned()),
                    )
                    .record(),
                );
            }
        }
    }
    (trace, patch)
}

fn run_llm(
    config: &PipelineConfig,
    engines: &EngineBundle,
    pages: &[PageResult],
) -> (Option<FallbackTrace>, Option<FallbackPatch>) {
    let client = engines.llm.as_ref().unwrap();

    // Text the recognizers were confident about goes into the prompt;
    // when nothing clears the bar (the usual state of a gated document)
    // every non-empty block is offered instead.
    let collect = |min_conf: f32| -> String {
        pages
            .iter()
            .flat_map(|p| p.blocks.iter())
            .filter(|b| b.confidence >= min_conf && !b.ocr_text.is_empty())
            .map(|b| b.ocr_text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut text = collect(LLM_PROMPT_MIN_CONFIDENCE);
    if text.is_empty() {
        text = collect(0.0);
    }
    if text.is_empty() {
        tracing::debug!("no text to normalize, skipping LLM");
        return (None, None);
    }

    let request = LlmRequest {
        text,
        context: LlmContext::default(),
        timeout: Duration::from_secs(config.llm_timeout_seconds),
    };

    let mut last_error = None;
    for attempt in 0..config.llm_max_retries.max(1) {
        if attempt > 0 {
            std::thread::sleep(Duration::from_millis(200 * (1 << attempt.min(4))));
        }
        match client.normalize(&request) {
            Ok(raw) => {
                let patch = llm::validate_response(&raw).map(FallbackPatch::from);
                if patch.is_none() {
                    tracing::warn!("LLM response did not conform to schema, discarding");
                }
                let trace = Some(FallbackTrace {
                    engine: "llm".to_owned(),
                    raw,
                    merged: false,
                });
                return (trace, patch);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "LLM normalization attempt failed");
                last_error = Some(e);
            }
        }
    }
    tracing::warn!(
        error = ?last_error,
        "LLM normalizer unavailable after retries"
    );
    (None, None)
}

/// Donut's `text` is model-specific. Accept a JSON object with card keys,
/// or `key: value` lines; anything else is unusable.
pub fn adapt_donut_text(text: &str) -> Option<FallbackPatch> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(object) = value.as_object() {
            let mut patch = FallbackPatch {
                confidence: DONUT_SELF_CONFIDENCE,
                ..Default::default()
            };
            let get_str =
                |key: &str| object.get(key).and_then(|v| v.as_str()).map(str::to_owned);
            let get_num = |key: &str| object.get(key).and_then(|v| v.as_f64());
            patch.supplier_name = get_str("supplier_name").or_else(|| get_str("supplier"));
            patch.invoice_number = get_str("invoice_number");
            patch.invoice_date = get_str("invoice_date")
                .and_then(|raw| chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok());
            patch.currency = get_str("currency").and_then(|c| Currency::from_code(&c));
            patch.subtotal = get_num("subtotal");
            patch.tax_amount = get_num("tax_amount");
            patch.total_amount = get_num("total_amount").or_else(|| get_num("total"));
            if let Some(lines) = object.get("lines").and_then(|v| v.as_array()) {
                for line in lines {
                    if let Ok(line) = serde_json::from_value::<llm::LlmLine>(line.clone()) {
                        patch.lines.push(line);
                    }
                }
            }
            return Some(patch);
        }
    }

    // `key: value` lines.
    let mut patch = FallbackPatch {
        confidence: DONUT_SELF_CONFIDENCE,
        ..Default::default()
    };
    let mut any = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_lowercase().as_str() {
            "supplier" | "supplier_name" => {
                patch.supplier_name = Some(value.to_owned());
                any = true;
            }
            "invoice_number" | "invoice no" => {
                patch.invoice_number = Some(value.to_owned());
                any = true;
            }
            "total" | "total_amount" => {
                if let Some(amount) = Amount::from_capture(value, None).and_then(|a| a.major()) {
                    patch.total_amount = Some(amount);
                    any = true;
                }
            }
            _ => {}
        }
    }
    any.then_some(patch)
}

fn assemble_card(
    fields: &HeaderFields,
    pages: &[PageResult],
    template_match: Option<String>,
) -> InvoiceCard {
    let line_items: Vec<LineItem> = pages
        .iter()
        .flat_map(|p| p.line_items().cloned())
        .collect();

    InvoiceCard {
        supplier_name: fields.supplier_name.as_ref().map(|f| f.value.clone()),
        invoice_number: fields.invoice_number.as_ref().map(|f| f.value.clone()),
        invoice_date: fields.invoice_date.as_ref().map(|f| f.value),
        currency: fields.currency.as_ref().map(|f| f.value),
        subtotal: fields.subtotal.as_ref().map(|f| f.value.clone()),
        tax_amount: fields.tax_amount.as_ref().map(|f| f.value.clone()),
        total_amount: fields.total_amount.as_ref().map(|f| f.value.clone()),
        line_items,
        overall_confidence: 0.0,
        status: Status::Partial,
        validation_errors: Vec::new(),
        template_match,
    }
}

/// True when the fallback may write this field: it is missing, or the
/// block it was read from was less confident than the fallback
/// self-reports. A field backed by a stronger block is never overridden.
fn patch_may_write<T>(existing: &Option<crate::fields::ExtractedField<T>>, patch_conf: f32) -> bool {
    match existing {
        None => true,
        Some(field) => field.confidence < patch_conf,
    }
}

/// Merge a fallback patch into the card. Line items are only supplied
/// when the document has none.
fn merge_patch(card: &mut InvoiceCard, fields: &HeaderFields, patch: &FallbackPatch) -> bool {
    let mut merged = false;
    let currency = card.currency.or(patch.currency);

    if let Some(value) = &patch.supplier_name {
        if patch_may_write(&fields.supplier_name, patch.confidence) {
            card.supplier_name = Some(value.clone());
            merged = true;
        }
    }
    if let Some(value) = &patch.invoice_number {
        if patch_may_write(&fields.invoice_number, patch.confidence) {
            card.invoice_number = Some(value.clone());
            merged = true;
        }
    }
    if let Some(value) = patch.invoice_date {
        if patch_may_write(&fields.invoice_date, patch.confidence) {
            card.invoice_date = Some(value);
            merged = true;
        }
    }
    if let Some(value) = patch.currency {
        if patch_may_write(&fields.currency, patch.confidence) {
            card.currency = Some(value);
            merged = true;
        }
    }
    if let Some(value) = patch.subtotal {
        if patch_may_write(&fields.subtotal, patch.confidence) {
            card.subtotal = Some(Amount::from_major(value, currency));
            merged = true;
        }
    }
    if let Some(value) = patch.tax_amount {
        if patch_may_write(&fields.tax_amount, patch.confidence) {
            card.tax_amount = Some(Amount::from_major(value, currency));
            merged = true;
        }
    }
    if let Some(value) = patch.total_amount {
        if patch_may_write(&fields.total_amount, patch.confidence) {
            card.total_amount = Some(Amount::from_major(value, currency));
            merged = true;
        }
    }

    if card.line_items.is_empty() && !patch.lines.is_empty() {
        card.line_items = patch
            .lines
            .iter()
            .enumerate()
            .map(|(i, line)| LineItem {
                description: line.description.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price.map(|v| Amount::from_major(v, currency)),
                line_total: line.line_total.map(|v| Amount::from_major(v, currency)),
                vat: None,
                confidence: patch.confidence,
                row_index: i,
                provenance: Provenance::Semantic,
            })
            .collect();
        merged = true;
    }
    merged
}

/// Totals validation and the final status decision.
fn validate_card(card: &mut InvoiceCard, config: &PipelineConfig, overall: f32) {
    let calc_subtotal: f64 = card
        .line_items
        .iter()
        .filter_map(|i| i.line_total.as_ref().and_then(|a| a.major()))
        .sum();
    let tax = card.tax_amount.as_ref().and_then(|a| a.major()).unwrap_or(0.0);
    let calc_grand = calc_subtotal + tax;

    let Some(total) = card.total_amount.as_ref().and_then(|a| a.major()) else {
        card.validation_errors
            .push("total_amount missing, cannot validate totals".to_owned());
        card.status = Status::NeedsReview;
        return;
    };

    let err = (calc_grand - total).abs() / total.max(f64::EPSILON);
    if err > config.llm_validation_error_threshold {
        card.validation_errors.push(format!(
            "calc_grand {calc_grand:.2} vs extracted total {total:.2} exceeds {:.0}% tolerance",
            config.llm_validation_error_threshold * 100.0
        ));
        card.status = Status::NeedsReview;
        return;
    }

    let critical_present = card.supplier_name.is_some()
        && card.invoice_number.is_some()
        && card.invoice_date.is_some();
    card.status = if critical_present && overall >= config.conf_page_min {
        Status::Ok
    } else {
        Status::Partial
    };
}
