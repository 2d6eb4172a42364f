//! Page rasterization. The only component that touches the input mime:
//! PDFs are rendered through pdfium at the configured density, raster
//! images are copied through and measured. Everything downstream operates
//! on `RasterPage`s.

use std::path::Path;

use anyhow::Context;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::instrument;

use crate::artifacts::{self, ArtifactSink};
use crate::entities::{Document, RasterPage};
use crate::errors::StageError;

const POINTS_PER_INCH: f32 = 72.0;

/// Mime sniffed from the file extension; the decoders do the real
/// validation.
pub fn detect_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())?
        .as_str()
    {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Bind the pdfium library: a bundled copy next to the executable wins,
/// then the system library.
pub fn bind_pdfium() -> anyhow::Result<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .context("binding pdfium library")?;
    Ok(Pdfium::new(bindings))
}

#[derive(Debug)]
pub struct RasterOutcome {
    pub document: Document,
    pub pages: Vec<RasterPage>,
    /// `(page_index, error)` for pages that failed to render. Partial
    /// success is permitted and recorded per page.
    pub page_errors: Vec<(usize, String)>,
}

#[derive(Debug, Clone)]
pub struct Rasterizer {
    dpi: u32,
}

impl Rasterizer {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }

    /// Rasterize the input and persist `original.*` plus one
    /// `pages/page_NNN.png` per rendered page.
    #[instrument(skip(self, sink))]
    pub fn rasterize(
        &self,
        input: &Path,
        sink: &dyn ArtifactSink,
    ) -> Result<RasterOutcome, StageError> {
        let mime = detect_mime(input)
            .ok_or_else(|| StageError::InputUnreadable(format!("unsupported input: {input:?}")))?;
        let bytes = std::fs::read(input)
            .map_err(|e| StageError::InputUnreadable(format!("cannot read {input:?}: {e}")))?;
        if bytes.is_empty() {
            return Err(StageError::InputUnreadable(format!("empty input: {input:?}")));
        }

        let slug = crate::entities::slugify(input);
        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        sink.write_bytes(&artifacts::original_rel(&slug, &extension), &bytes)
            .map_err(|e| StageError::InputUnreadable(format!("cannot persist original: {e}")))?;

        if mime == "application/pdf" {
            self.rasterize_pdf(input, &bytes, mime, &slug, sink)
        } else {
            self.passthrough_image(input, &bytes, mime, &slug, sink)
        }
    }

    fn rasterize_pdf(
        &self,
        input: &Path,
        bytes: &[u8],
        mime: &str,
        slug: &str,
        sink: &dyn ArtifactSink,
    ) -> Result<RasterOutcome, StageError> {
        let pdfium = bind_pdfium()
            .map_err(|e| StageError::InputUnreadable(format!("pdfium unavailable: {e}")))?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| StageError::InputUnreadable(format!("cannot open {input:?}: {e}")))?;

        let page_count = document.pages().len() as usize;
        if page_count == 0 {
            return Err(StageError::InputUnreadable(format!(
                "document has no pages: {input:?}"
            )));
        }

        let scale = self.dpi as f32 / POINTS_PER_INCH;
        let mut pages = Vec::with_capacity(page_count);
        let mut page_errors = Vec::new();

        for (idx, page) in document.pages().iter().enumerate() {
            let page_index = idx + 1;
            match self.render_page(&page, scale) {
                Ok(image) => match self.persist_page(slug, page_index, image, sink) {
                    Ok(raster) => pages.push(raster),
                    Err(e) => page_errors.push((page_index, e.to_string())),
                },
                Err(e) => {
                    tracing::warn!(page_index, error = %e, "page render failed");
                    page_errors.push((page_index, e.to_string()));
                }
            }
        }

        Ok(RasterOutcome {
            document: Document::new(input, mime, page_count),
            pages,
            page_errors,
        })
    }

    fn render_page(&self, page: &PdfPage, scale: f32) -> anyhow::Result<DynamicImage> {
        let bitmap = page
            .render_with_config(&PdfRenderConfig::default().scale_page_by_factor(scale))
            .context("rendering page bitmap")?;
        Ok(bitmap.as_image())
    }

    fn passthrough_image(
        &self,
        input: &Path,
        bytes: &[u8],
        mime: &str,
        slug: &str,
        sink: &dyn ArtifactSink,
    ) -> Result<RasterOutcome, StageError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| StageError::InputUnreadable(format!("cannot decode {input:?}: {e}")))?;
        let raster = self
            .persist_page(slug, 1, image, sink)
            .map_err(|e| StageError::InputUnreadable(format!("cannot persist page: {e}")))?;
        Ok(RasterOutcome {
            document: Document::new(input, mime, 1),
            pages: vec![raster],
            page_errors: Vec::new(),
        })
    }

    fn persist_page(
        &self,
        slug: &str,
        page_index: usize,
        image: DynamicImage,
        sink: &dyn ArtifactSink,
    ) -> anyhow::Result<RasterPage> {
        let rel = artifacts::page_image_rel(slug, page_index);
        artifacts::write_png(sink, &rel, &image)?;
        Ok(RasterPage {
            page_index,
            width_px: image.width(),
            height_px: image.height(),
            density_dpi: self.dpi,
            image_path: sink.resolve(&rel).unwrap_or(rel),
            image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemorySink;

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(detect_mime(Path::new("a.PDF")), Some("application/pdf"));
        assert_eq!(detect_mime(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(detect_mime(Path::new("a.tiff")), Some("image/tiff"));
        assert_eq!(detect_mime(Path::new("a.docx")), None);
        assert_eq!(detect_mime(Path::new("noext")), None);
    }

    #[test]
    fn zero_byte_input_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.png");
        std::fs::write(&path, b"").unwrap();
        let sink = MemorySink::new();
        let err = Rasterizer::new(200).rasterize(&path, &sink).unwrap_err();
        assert!(matches!(err, StageError::InputUnreadable(_)));
    }

    #[test]
    fn raster_image_passthrough_measures_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Receipt Photo.png");
        let image = DynamicImage::new_luma8(320, 240);
        image.save(&path).unwrap();

        let sink = MemorySink::new();
        let outcome = Rasterizer::new(200).rasterize(&path, &sink).unwrap();
        assert_eq!(outcome.document.slug, "receipt_photo");
        assert_eq!(outcome.document.page_count, 1);
        assert_eq!(outcome.pages.len(), 1);
        assert_eq!(outcome.pages[0].width_px, 320);
        assert_eq!(outcome.pages[0].height_px, 240);
        assert!(sink
            .get(Path::new("receipt_photo/pages/page_001.png"))
            .is_some());
        assert!(sink
            .get(Path::new("receipt_photo/original.png"))
            .is_some());
    }
}
