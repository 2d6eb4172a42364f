//! The document pipeline: raster → preprocess → layout → ocr →
//! tables + fields → reconcile → artifacts.
//!
//! Every stage recovers locally and advances; the only terminal error is
//! an unreadable input. Pages are processed sequentially by default and
//! may be mapped in parallel, with page order preserved in the manifest
//! either way. Cancellation is honored between pages.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde_json::json;
use tracing::instrument;

use crate::artifacts::{self, ArtifactSink};
use crate::config::PipelineConfig;
use crate::engines::EngineBundle;
use crate::entities::{
    HtrBlock, HtrData, PageResult, PreprocMeta, PreprocPath, RasterPage, ScanReport, Status,
};
use crate::errors::StageError;
use crate::fields::{self, FieldContext};
use crate::ocr;
use crate::raster::Rasterizer;
use crate::readiness;
use crate::reconcile;
use crate::store::{Audit, AuditEvent, DocumentRecord, InvoiceRecord, NoopAudit, NoopStore, Store};
use crate::tables;
use crate::templates;

const AUDIT_ACTOR: &str = "pipeline";

pub struct ScanPipeline {
    config: PipelineConfig,
    engines: EngineBundle,
    sink: Arc<dyn ArtifactSink>,
    store: Arc<dyn Store>,
    audit: Arc<dyn Audit>,
    debug: bool,
}

impl ScanPipeline {
    pub fn new(config: PipelineConfig, engines: EngineBundle, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            config,
            engines,
            sink,
            store: Arc::new(NoopStore),
            audit: Arc::new(NoopAudit),
            debug: false,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn Audit>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn process(&self, input: &std::path::Path) -> ScanReport {
        self.process_cancellable(input, &AtomicBool::new(false))
    }

    /// Run the pipeline. The cancel flag is checked between pages:
    /// in-flight stages run to completion and their artifacts are kept.
    #[instrument(skip_all, fields(input = %input.display()))]
    pub fn process_cancellable(&self, input: &std::path::Path, cancel: &AtomicBool) -> ScanReport {
        let started = Instant::now();

        let ready = readiness::probe(&self.engines);
        if !ready.ready {
            // The PDF renderer only blocks documents that need rendering.
            let input_is_pdf =
                crate::raster::detect_mime(input) == Some("application/pdf");
            let blocking: Vec<&str> = ready
                .missing_required
                .iter()
                .filter(|name| **name != "pdf_renderer" || input_is_pdf)
                .copied()
                .collect();
            if !blocking.is_empty() {
                let missing = blocking.join(", ");
                tracing::error!(missing = %missing, "pipeline refused to start");
                return ScanReport::input_error(format!("required components missing: {missing}"));
            }
        }

        // Rasterize. Unreadable input is the one terminal error.
        let outcome = match Rasterizer::new(self.config.raster_dpi).rasterize(input, &*self.sink) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "input unreadable");
                return ScanReport::input_error(e.record());
            }
        };
        let document = outcome.document.clone();
        let slug = document.slug.clone();
        self.audit_stage(
            "raster",
            json!({
                "doc_id": document.doc_id,
                "pages": outcome.pages.len(),
                "page_errors": outcome.page_errors.len(),
            }),
        );

        let bytes = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
        let _ = self.store.put_document(&DocumentRecord {
            doc_id: document.doc_id,
            filename: input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: input.to_owned(),
            bytes,
        });

        // Per-page stages: preprocess, layout, OCR, HTR.
        let mut page_work = self.run_pages(&outcome.pages, &slug, cancel);

        // Pages that never rasterized still appear in the report.
        for (page_index, error) in &outcome.page_errors {
            page_work.push((failed_page(*page_index, error), PathBuf::new()));
        }
        page_work.sort_by_key(|(page, _)| page.page_num);

        let (mut pages, page_paths): (Vec<PageResult>, Vec<PathBuf>) =
            page_work.into_iter().unzip();

        // Supplier template matching over the whole document text.
        let all_text: String = pages
            .iter()
            .flat_map(|p| p.blocks.iter())
            .map(|b| b.ocr_text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let template_match = self.match_template(&all_text);

        // Header fields and totals from non-table blocks, doc order.
        let context = FieldContext {
            known_supplier: template_match.clone(),
            date_order: Some(self.config.date_order),
            ..Default::default()
        };
        let header_fields =
            fields::extract_fields(pages.iter().flat_map(|p| p.blocks.iter()), &context);
        let currency = header_fields.currency.as_ref().map(|f| f.value);

        // Table reconstruction, now that the document currency is known.
        for page in &mut pages {
            let usable = page
                .blocks
                .iter()
                .any(|b| b.confidence >= self.config.min_usable_ocr_confidence);
            if !usable {
                tracing::debug!(
                    page = page.page_num,
                    "OCR below usable threshold, skipping table reconstruction"
                );
                continue;
            }
            for block in &page.blocks {
                if block.block_type == crate::entities::BlockType::Table {
                    page.tables.push(tables::reconstruct_table(block, currency));
                }
            }
        }
        self.audit_stage(
            "tables",
            json!({
                "doc_id": document.doc_id,
                "line_items": pages.iter().map(|p| p.line_items().count()).sum::<usize>(),
            }),
        );

        let outcome = reconcile::reconcile(
            &self.config,
            &self.engines,
            header_fields,
            pages,
            &page_paths,
            template_match,
        );
        let reconcile::ReconcileOutcome {
            mut invoice,
            pages,
            fallback,
            overall_confidence,
        } = outcome;
        self.audit_stage(
            "reconcile",
            json!({
                "doc_id": document.doc_id,
                "status": invoice.status,
                "overall_confidence": overall_confidence,
            }),
        );

        // A page that degraded on the way keeps the run from claiming ok.
        let any_page_errors = pages.iter().any(|p| !p.errors.is_empty());
        if any_page_errors && invoice.status == Status::Ok {
            invoice.status = Status::Partial;
        }
        let status = invoice.status;

        let _ = self.store.upsert_invoice(&InvoiceRecord {
            doc_id: document.doc_id,
            supplier: invoice.supplier_name.clone(),
            date: invoice.invoice_date,
            value: invoice.total_amount.as_ref().and_then(|a| a.major()),
            status,
            confidence: overall_confidence,
        });

        let report = ScanReport {
            status,
            document: Some(document.clone()),
            pages,
            overall_confidence,
            invoice: Some(invoice),
            artifact_dir: self
                .sink
                .resolve(std::path::Path::new(&slug))
                .unwrap_or_else(|| PathBuf::from(&slug))
                .display()
                .to_string(),
            elapsed_sec: started.elapsed().as_secs_f64(),
            fallback,
            error: None,
        };

        if let Err(e) = artifacts::write_json(&*self.sink, &artifacts::manifest_rel(&slug), &report)
        {
            tracing::error!(error = %e, "failed to persist manifest");
        }
        self.audit_stage("persist", json!({"doc_id": document.doc_id, "status": status}));

        report
    }

    fn run_pages(
        &self,
        rasters: &[RasterPage],
        slug: &str,
        cancel: &AtomicBool,
    ) -> Vec<(PageResult, PathBuf)> {
        if self.config.parallel_pages {
            rasters
                .par_iter()
                .map(|raster| self.process_page(raster, slug, cancel))
                .collect()
        } else {
            rasters
                .iter()
                .map(|raster| self.process_page(raster, slug, cancel))
                .collect()
        }
    }

    /// One page through preprocess, layout, OCR and HTR. Never fails;
    /// degradation lands in the page's `errors`.
    #[instrument(skip_all, fields(page_index = raster.page_index))]
    fn process_page(
        &self,
        raster: &RasterPage,
        slug: &str,
        cancel: &AtomicBool,
    ) -> (PageResult, PathBuf) {
        if cancel.load(Ordering::Relaxed) {
            return (cancelled_page(raster.page_index), PathBuf::new());
        }
        let page_index = raster.page_index;

        let probe = |img: &image::GrayImage| ocr::full_page_metrics(&self.engines, img);
        let pre = crate::preprocess::preprocess_page(
            &raster.image,
            self.config.max_long_edge_px,
            self.config.feature_dewarp,
            self.config.feature_dual_path_preproc,
            &probe,
        );
        self.audit_stage(
            "preprocess",
            json!({"page": page_index, "path": pre.meta.path}),
        );

        let pre_rel = artifacts::pre_image_rel(slug, page_index);
        if let Err(e) = artifacts::write_png(
            &*self.sink,
            &pre_rel,
            &image::DynamicImage::ImageLuma8(pre.image.clone()),
        ) {
            tracing::warn!(page_index, error = %e, "failed to persist preprocessed page");
        }
        let pre_path = self.sink.resolve(&pre_rel).unwrap_or(pre_rel);

        let layout = crate::layout::detect_page_layout(
            self.engines.layout.as_deref(),
            &pre.image,
            page_index,
        );
        if let Err(e) = artifacts::write_json(
            &*self.sink,
            &artifacts::layout_json_rel(slug, page_index),
            &layout,
        ) {
            tracing::warn!(page_index, error = %e, "failed to persist layout artifact");
        }
        self.audit_stage(
            "layout",
            json!({"page": page_index, "blocks": layout.blocks.len(), "method": layout.method_used}),
        );

        if self.debug {
            let overlay = crate::draw::draw_layout_blocks(&layout, &pre.image);
            let _ = artifacts::write_png(
                &*self.sink,
                &artifacts::debug_image_rel(slug, page_index),
                &image::DynamicImage::ImageRgba8(overlay),
            );
        }

        let page_ocr = ocr::ocr_page(
            &self.engines,
            &pre.image,
            &layout,
            pre.meta.path,
            page_index,
            self.config.conf_field_min,
        );
        if let Err(e) = artifacts::write_json(
            &*self.sink,
            &artifacts::ocr_json_rel(slug, page_index),
            &page_ocr,
        ) {
            tracing::warn!(page_index, error = %e, "failed to persist OCR artifact");
        }
        self.audit_stage(
            "ocr",
            json!({
                "page": page_index,
                "confidence_avg": page_ocr.confidence_avg,
                "low_confidence_blocks": page_ocr.low_confidence_blocks,
            }),
        );

        let htr_data = self.run_htr(&pre.image, &layout);

        let page_result = PageResult {
            page_num: page_index,
            confidence: page_ocr.confidence_avg,
            blocks: page_ocr.blocks,
            preprocessing: pre.meta,
            tables: Vec::new(),
            fallback_text: None,
            donut_data: None,
            htr_data,
            errors: page_ocr.errors,
        };
        (page_result, pre_path)
    }

    fn run_htr(
        &self,
        page: &image::GrayImage,
        layout: &crate::entities::PageLayout,
    ) -> Option<HtrData> {
        if !self.config.feature_htr {
            return None;
        }
        let htr = self.engines.htr.as_ref()?;

        let mut blocks = Vec::new();
        let mut review_candidates = 0usize;
        for block in layout
            .blocks
            .iter()
            .filter(|b| b.block_type == crate::entities::BlockType::Handwriting)
        {
            let (crop, empty) = ocr::crop_block(page, block);
            if empty {
                continue;
            }
            match htr.transcribe(&crop) {
                Ok(lines) => {
                    if lines.confidence < self.config.htr_confidence_threshold {
                        review_candidates += 1;
                    }
                    blocks.push(HtrBlock {
                        bbox: block.bbox.clone(),
                        text: lines.text,
                        confidence: lines.confidence,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "handwriting transcription failed");
                }
            }
        }
        (!blocks.is_empty()).then_some(HtrData {
            blocks,
            review_candidates,
        })
    }

    fn match_template(&self, text: &str) -> Option<String> {
        if !self.config.feature_templates || text.is_empty() {
            return None;
        }
        let path = self.config.template_path.as_ref()?;
        match templates::load_templates(path) {
            Ok(loaded) => {
                templates::match_supplier(text, &loaded).map(|t| t.supplier.clone())
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load supplier templates");
                None
            }
        }
    }

    fn audit_stage(&self, op: &str, payload: serde_json::Value) {
        self.audit.append(AuditEvent::now(AUDIT_ACTOR, op, payload));
    }
}

fn failed_page(page_index: usize, error: &str) -> PageResult {
    let mut meta = PreprocMeta::new(PreprocPath::Minimal);
    meta.warn("page never rasterized");
    PageResult {
        page_num: page_index,
        blocks: Vec::new(),
        confidence: 0.0,
        preprocessing: meta,
        tables: Vec::new(),
        fallback_text: None,
        donut_data: None,
        htr_data: None,
        errors: vec![StageError::PagePreprocFailure(error.to_owned()).record()],
    }
}

fn cancelled_page(page_index: usize) -> PageResult {
    let mut meta = PreprocMeta::new(PreprocPath::Minimal);
    meta.warn("cancelled before processing");
    PageResult {
        page_num: page_index,
        blocks: Vec::new(),
        confidence: 0.0,
        preprocessing: meta,
        tables: Vec::new(),
        fallback_text: None,
        donut_data: None,
        htr_data: None,
        errors: vec!["Cancelled: processing stopped before this page".to_owned()],
    }
}
