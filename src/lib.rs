//! # docpipe
//!
//! Convert PDF documents into structured per-page content: Markdown, page
//! images and table structure, through a batched multi-stage pipeline.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Rasterize   render pages + text layer via pdfium (spawn_blocking)
//!  ├─ 2. Layout      regions and reading order from the text layer
//!  ├─ 3. OCR         vision LLM, only for pages without text (optional)
//!  ├─ 4. Tables      row/column structure for table regions (optional)
//!  ├─ 5. Assemble    pages back in document order
//!  └─ 6. Export      Markdown, JSON, ZIP archive or files on disk
//! ```
//!
//! Each stage batches pages and runs on its own bounded queue; a full queue
//! suspends the stage before it, so memory stays bounded however large the
//! document. Pages that fail in one stage are recorded as faults and still
//! appear in the output.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docpipe::{Converter, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converter = Converter::new(PipelineConfig::markdown().build()?)?;
//!     let doc = converter.convert("document.pdf").await?;
//!     for page in &doc.pages {
//!         println!("--- page {} ---\n{}", page.index, page.markdown);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `docpipe` binary (clap + anyhow + tracing-subscriber) |
//! | `server` | on      | Enables [`server`], the HTTP conversion service (axum) |
//!
//! Disable both when using only the library:
//! ```toml
//! docpipe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
#[cfg(feature = "server")]
pub mod server;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    Accelerator, FaultPolicy, OcrPolicy, PageSelection, PageSeparator, PipelineConfig,
    PipelineConfigBuilder, StageSettings, VlmSettings,
};
pub use convert::{convert_sync, inspect, Converter, ConverterBuilder};
pub use error::{ConvertError, PageFault, StageError};
pub use export::image::ImageFormat;
pub use export::markdown::{document_markdown, page_markdown};
pub use export::package::{AggregateResponse, ArchiveBuilder, MarkdownResponse, PersistSummary};
pub use model::{
    BoundingBox, Document, DocumentMetadata, Page, Provenance, Region, RegionKind, TableCell,
    TableStructure, TextCell,
};
pub use pipeline::rasterize::{PageFeed, RasterPage, RasterResult};
pub use pipeline::scheduler::{Conversion, StageBackends};
pub use pipeline::stage::{ItemResult, StageBackend, StageItem, StageKind};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_stream, page_stream, PageStream};
