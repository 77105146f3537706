//! Conversion entry points.
//!
//! A [`Converter`] owns one validated [`PipelineConfig`] and the stage
//! backends built from it, and can run any number of conversions, one after
//! another or concurrently. [`Converter::start`] hands back the running
//! [`Conversion`] for page-level access and cancellation; the `convert_*`
//! methods wait for the whole [`Document`].

use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::export::markdown::document_markdown;
use crate::model::{Document, DocumentMetadata};
use crate::pipeline::accelerator::AcceleratorPool;
use crate::pipeline::input::{self, InputDocument};
use crate::pipeline::layout::TextLayerLayout;
use crate::pipeline::ocr::VlmOcr;
use crate::pipeline::rasterize::{self, PageFeed};
use crate::pipeline::scheduler::{Conversion, Scheduler, StageBackends};
use crate::pipeline::stage::{StageBackend, StageKind};
use crate::pipeline::table::GridTableStructure;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs documents through the staged pipeline.
#[derive(Debug, Clone)]
pub struct Converter {
    scheduler: Scheduler,
}

/// Builder for [`Converter`]. Stages without an explicit backend get the
/// default one; disabled stages get none.
pub struct ConverterBuilder {
    config: PipelineConfig,
    backends: StageBackends,
    accelerators: Option<Arc<AcceleratorPool>>,
}

impl ConverterBuilder {
    /// Use `backend` for `kind` instead of the default.
    pub fn backend(mut self, kind: StageKind, backend: Arc<dyn StageBackend>) -> Self {
        self.backends = self.backends.with(kind, backend);
        self
    }

    /// Use a private accelerator pool instead of the process-wide one.
    pub fn accelerators(mut self, pool: Arc<AcceleratorPool>) -> Self {
        self.accelerators = Some(pool);
        self
    }

    pub fn build(self) -> Result<Converter, ConvertError> {
        let mut backends = self.backends;
        for kind in StageKind::ALL {
            if self.config.stage(kind).enabled && backends.get(kind).is_none() {
                debug!("Using default {} backend", kind);
                backends = backends.with(kind, default_backend(kind, &self.config));
            }
        }
        let accelerators = self.accelerators.unwrap_or_else(AcceleratorPool::global);
        let scheduler = Scheduler::new(Arc::new(self.config), backends, accelerators)?;
        Ok(Converter { scheduler })
    }
}

fn default_backend(kind: StageKind, config: &PipelineConfig) -> Arc<dyn StageBackend> {
    match kind {
        StageKind::Layout => Arc::new(TextLayerLayout::default()),
        StageKind::Ocr => Arc::new(VlmOcr::new(config.vlm.clone())),
        StageKind::TableStructure => Arc::new(GridTableStructure::default()),
    }
}

impl Converter {
    /// A converter with the default backend for every enabled stage.
    pub fn new(config: PipelineConfig) -> Result<Self, ConvertError> {
        Self::builder(config).build()
    }

    pub fn builder(config: PipelineConfig) -> ConverterBuilder {
        ConverterBuilder {
            config,
            backends: StageBackends::new(),
            accelerators: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        self.scheduler.config()
    }

    /// Run an already open page feed.
    pub fn start_pages(&self, name: impl Into<String>, feed: PageFeed) -> Conversion {
        self.scheduler.run(name, feed)
    }

    /// Open `bytes` and start converting. Returns once the page count is
    /// known; pages are processed in the background.
    pub async fn start(&self, name: &str, bytes: Vec<u8>) -> Result<Conversion, ConvertError> {
        let feed = rasterize::open(bytes, name, self.config()).await?;
        if feed.expected.is_empty() && feed.total_pages > 0 {
            return Err(ConvertError::PageOutOfRange {
                page: 0,
                total: feed.total_pages,
            });
        }
        Ok(self.start_pages(name, feed))
    }

    /// Convert in-memory document bytes.
    pub async fn convert_bytes(&self, name: &str, bytes: Vec<u8>) -> Result<Document, ConvertError> {
        let conversion = self.start(name, bytes).await?;
        conversion.document().await
    }

    /// Convert a local file or an HTTP(S) URL.
    pub async fn convert(&self, input: impl AsRef<str>) -> Result<Document, ConvertError> {
        let input = input.as_ref();
        info!("Starting conversion: {}", input);
        let InputDocument { name, bytes } =
            input::load_input(input, self.config().download_timeout_secs).await?;
        self.convert_bytes(&name, bytes).await
    }

    /// Convert and write the document Markdown to `output_path`.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn convert_to_file(
        &self,
        input: impl AsRef<str>,
        output_path: impl AsRef<Path>,
    ) -> Result<Document, ConvertError> {
        let doc = self.convert(input).await?;
        let markdown = document_markdown(&doc, &self.config().page_separator);
        write_atomic(output_path.as_ref(), markdown.as_bytes()).await?;
        Ok(doc)
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConvertError> {
    let write_failed = |source| ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_failed)?;
    Ok(())
}

/// Synchronous wrapper around [`Converter::convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(input: impl AsRef<str>, config: PipelineConfig) -> Result<Document, ConvertError> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {}", e)))?;
    runtime.block_on(async {
        let converter = Converter::new(config)?;
        converter.convert(input).await
    })
}

/// Extract PDF metadata without converting content.
///
/// Does not require an LLM provider or API key.
pub async fn inspect(
    input: impl AsRef<str>,
    password: Option<String>,
) -> Result<DocumentMetadata, ConvertError> {
    let InputDocument { name, bytes } = input::load_input(input.as_ref(), 120).await?;
    rasterize::read_metadata(bytes, &name, password).await
}
