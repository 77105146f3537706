//! Error types for the docpipe library.
//!
//! Three error types map onto three failure scopes:
//!
//! * [`ConvertError`] — **Fatal**: the conversion cannot produce a document
//!   (unreadable input, stage backend down, batch timeout, cancellation).
//!   Returned as `Err(ConvertError)` from every `convert*` entry point.
//!
//! * [`PageFault`] — **Non-fatal**: one page failed to rasterize or one stage
//!   could not process it. Recorded on [`crate::model::Page::faults`] and
//!   rendered as an explicit marker in every export, so a result never
//!   claims success while silently omitting a page.
//!
//! * [`StageError`] — returned by a [`crate::pipeline::stage::StageBackend`]
//!   when the whole batch failed. The scheduler escalates it to
//!   [`ConvertError::StageUnavailable`].

use crate::pipeline::stage::StageKind;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docpipe library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// No page of the document could be decoded.
    #[error("Document '{name}' is unreadable: {reason}")]
    DocumentUnreadable { name: String, reason: String },

    /// PDF requires a password but none was provided.
    #[error("Document '{name}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { name: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for document '{name}'")]
    WrongPassword { name: String },

    /// A page number outside the conversion's selection was requested.
    #[error("Page {page} is out of range (conversion covers {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// A stage backend failed for a whole batch.
    #[error("Stage '{stage}' is unavailable: {detail}")]
    StageUnavailable { stage: StageKind, detail: String },

    /// A batch did not finish within the dispatch timeout.
    #[error("Stage '{stage}' timed out after {secs}s on pages {pages:?}")]
    StageTimeout {
        stage: StageKind,
        pages: Vec<usize>,
        secs: u64,
    },

    /// The conversion was cancelled before the document was assembled.
    #[error("Conversion cancelled")]
    Cancelled,

    /// The configured OCR provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Export errors ─────────────────────────────────────────────────────
    /// A page image was requested but was never retained or failed to render.
    #[error("Image generation failed for page {page}: {reason}")]
    ImageUnavailable { page: usize, reason: String },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive packaging failed.
    #[error("Failed to build archive: {0}")]
    Archive(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Place the pdfium shared library next to the binary or install it system-wide:\n\
  • Linux:   libpdfium.so in ./ or on LD_LIBRARY_PATH\n\
  • macOS:   libpdfium.dylib in ./ or on DYLD_LIBRARY_PATH\n\
  • Windows: pdfium.dll in ./ or on PATH\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Whether the error was caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConvertError::InvalidInput { .. }
                | ConvertError::NotAPdf { .. }
                | ConvertError::PasswordRequired { .. }
                | ConvertError::WrongPassword { .. }
                | ConvertError::InvalidConfig(_)
        )
    }
}

/// A non-fatal error for a single page.
///
/// Stored on [`crate::model::Page`]. The overall conversion continues unless
/// every page fails to decode.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageFault {
    /// Page rasterization failed.
    #[error("Page {page}: decode failed: {detail}")]
    Decode { page: usize, detail: String },

    /// The page loaded but its bitmap could not be rendered. Stages that
    /// only need the text layer still run.
    #[error("Page {page}: render failed: {detail}")]
    Render { page: usize, detail: String },

    /// One stage could not process this page.
    #[error("Page {page}: {stage} stage failed: {detail}")]
    Stage {
        page: usize,
        stage: StageKind,
        detail: String,
    },
}

impl PageFault {
    /// Raised by a stage backend, as opposed to the rasterizer.
    pub fn is_stage_fault(&self) -> bool {
        matches!(self, PageFault::Stage { .. })
    }

    pub fn page(&self) -> usize {
        match self {
            PageFault::Decode { page, .. }
            | PageFault::Render { page, .. }
            | PageFault::Stage { page, .. } => *page,
        }
    }
}

/// A stage-wide failure reported by a backend for a whole batch.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The backend cannot serve requests (model missing, provider down).
    #[error("{0}")]
    Unavailable(String),

    /// The backend answered with the wrong number of per-item results.
    #[error("backend returned {got} results for a batch of {expected}")]
    BatchMismatch { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timeout_display_names_stage_and_pages() {
        let e = ConvertError::StageTimeout {
            stage: StageKind::Ocr,
            pages: vec![3, 4],
            secs: 120,
        };
        let msg = e.to_string();
        assert!(msg.contains("ocr"), "got: {msg}");
        assert!(msg.contains("[3, 4]"), "got: {msg}");
    }

    #[test]
    fn image_unavailable_display() {
        let e = ConvertError::ImageUnavailable {
            page: 2,
            reason: "page images were not retained".into(),
        };
        assert!(e.to_string().starts_with("Image generation failed for page 2"));
    }

    #[test]
    fn page_fault_serializes_with_kind_tag() {
        let fault = PageFault::Stage {
            page: 7,
            stage: StageKind::TableStructure,
            detail: "no grid".into(),
        };
        let json = serde_json::to_value(&fault).expect("serialize");
        assert_eq!(json["kind"], "stage");
        assert_eq!(json["stage"], "table_structure");
        assert_eq!(fault.page(), 7);
    }

    #[test]
    fn render_fault_is_not_a_stage_fault() {
        let fault = PageFault::Render {
            page: 1,
            detail: "bitmap allocation failed".into(),
        };
        assert!(!fault.is_stage_fault());
        assert_eq!(serde_json::to_value(&fault).unwrap()["kind"], "render");
        assert_eq!(fault.to_string(), "Page 1: render failed: bitmap allocation failed");
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(ConvertError::InvalidConfig("x".into()).is_client_error());
        assert!(!ConvertError::Cancelled.is_client_error());
    }
}
