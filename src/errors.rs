use thiserror::Error;

/// Failure taxonomy surfaced through the pipeline result. Stages recover
/// locally and advance; only `InputUnreadable` terminates a run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("input unreadable: {0}")]
    InputUnreadable(String),

    #[error("page preprocessing failed: {0}")]
    PagePreprocFailure(String),

    #[error("layout detection unavailable: {0}")]
    LayoutUnavailable(String),

    #[error("OCR failed for block: {0}")]
    OcrBlockFailure(String),

    #[error("table reconstruction failed: {0}")]
    TableReconstructFailure(String),

    #[error("fallback engine unavailable: {0}")]
    FallbackUnavailable(String),

    #[error("totals validation mismatch: {0}")]
    ValidationMismatch(String),
}

impl StageError {
    /// Short kind tag recorded in per-page `errors[]` arrays.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::InputUnreadable(_) => "InputUnreadable",
            StageError::PagePreprocFailure(_) => "PagePreprocFailure",
            StageError::LayoutUnavailable(_) => "LayoutUnavailable",
            StageError::OcrBlockFailure(_) => "OCRBlockFailure",
            StageError::TableReconstructFailure(_) => "TableReconstructFailure",
            StageError::FallbackUnavailable(_) => "FallbackUnavailable",
            StageError::ValidationMismatch(_) => "ValidationMismatch",
        }
    }

    /// Formatted for the `errors[]` arrays: `Kind: detail`.
    pub fn record(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
