//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as pages are assembled and stage batches complete.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a terminal progress bar, a log line, or a
//! metrics sink without the library knowing how the host communicates. The
//! trait is `Send + Sync` because events fire from stage worker tasks.
//!
//! # Example
//!
//! ```rust
//! use docpipe::{ConversionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, markdown_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, markdown_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::stage::StageKind;
use std::sync::Arc;

/// Called by the pipeline as it processes a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Page events arrive in completion order, which is not
/// page order.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after the page count is known, before any stage runs.
    ///
    /// # Arguments
    /// * `total_pages` — number of selected pages
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page reaches the assembler without faults.
    ///
    /// # Arguments
    /// * `page_num`     — 1-indexed page number
    /// * `total_pages`  — number of selected pages
    /// * `markdown_len` — byte length of the page's Markdown
    fn on_page_complete(&self, page_num: usize, total_pages: usize, markdown_len: usize) {
        let _ = (page_num, total_pages, markdown_len);
    }

    /// Called when a page reaches the assembler carrying at least one fault.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called after each stage batch returns.
    ///
    /// # Arguments
    /// * `stage`      — which stage ran
    /// * `batch_len`  — number of pages in the batch
    /// * `elapsed_ms` — wall-clock time of the backend call
    fn on_batch_complete(&self, stage: StageKind, batch_len: usize, elapsed_ms: u64) {
        let _ = (stage, batch_len, elapsed_ms);
    }

    /// Called once after the document is assembled.
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
