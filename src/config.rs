//! Configuration types for a pipeline conversion.
//!
//! All conversion behaviour is controlled through [`PipelineConfig`], built
//! via its [`PipelineConfigBuilder`]. A config is immutable once built and is
//! shared by every stage worker of one conversion.
//!
//! # Profiles
//! Two named profiles match the two service deployments:
//!
//! | Profile | Images | Layout batch | OCR batch | Table batch |
//! |---------|--------|--------------|-----------|-------------|
//! | [`PipelineConfig::archive`]  | on  | 64 | 4 | 4 |
//! | [`PipelineConfig::markdown`] | off | 8  | 1 | 1 |
//!
//! Both keep OCR configured but switched off, and run their stages on the
//! shared `cuda` accelerator context.

use crate::error::ConvertError;
use crate::pipeline::stage::StageKind;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-stage knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Disabled stages are never instantiated; pages pass through untouched.
    pub enabled: bool,
    /// Maximum items per dispatched batch. `1` means per-item dispatch with no wait.
    pub batch_size: usize,
    /// Parallel batches on the CPU pool. Ignored on an accelerator, which runs
    /// one batch at a time.
    pub workers: usize,
}

impl StageSettings {
    pub const fn new(batch_size: usize, workers: usize) -> Self {
        Self {
            enabled: true,
            batch_size,
            workers,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            batch_size: 1,
            workers: 1,
        }
    }
}

/// When the OCR stage runs on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrPolicy {
    /// Only pages where layout found no text-bearing region (scans). (default)
    #[default]
    Auto,
    /// Every page, replacing the text-layer regions.
    Force,
}

/// What happens to a page after one stage faults on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// The faulted page goes straight to the assembler. (default)
    #[default]
    PropagateFault,
    /// Downstream stages still run when their inputs allow it.
    BestEffort,
}

/// Where stage batches execute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// Independent CPU pool per stage, `workers` batches in parallel. (default)
    #[default]
    Cpu,
    /// Named device context shared process-wide; one batch at a time, FIFO.
    Device(String),
}

/// Settings for the vision-LLM OCR backend.
#[derive(Clone)]
pub struct VlmSettings {
    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Retries on a transient provider failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom system prompt. If None, uses [`crate::prompts::OCR_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,
}

impl Default for VlmSettings {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for VlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VlmSettings")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

/// Configuration for one pipeline conversion.
///
/// Built via [`PipelineConfig::builder()`], one of the profiles, or
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use docpipe::{PipelineConfig, StageSettings};
///
/// let config = PipelineConfig::builder()
///     .layout(StageSettings::new(16, 2))
///     .generate_page_images(true)
///     .queue_depth(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.layout.batch_size, 16);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    pub layout: StageSettings,
    pub ocr: StageSettings,
    pub table_structure: StageSettings,

    pub ocr_policy: OcrPolicy,
    pub fault_policy: FaultPolicy,
    pub accelerator: Accelerator,

    /// Raster scale relative to 72 DPI. Range: 0.25–8.0. Default: 1.0.
    pub images_scale: f32,

    /// Retain page bitmaps on the assembled pages for image export. Default: false.
    pub generate_page_images: bool,

    /// Cap on either bitmap edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Queue capacity per stage, in batches. Default: 2.
    pub queue_depth: usize,

    /// How long a partial batch waits for more items after its first one. Default: 50 ms.
    pub batch_wait_ms: u64,

    /// Dispatch timeout for a single batch. Default: 120 s.
    pub stage_timeout_secs: u64,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    /// Page separator in assembled Markdown. Default: blank line.
    pub page_separator: PageSeparator,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    pub vlm: VlmSettings,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            layout: StageSettings::new(8, 2),
            ocr: StageSettings::new(2, 2),
            table_structure: StageSettings::new(4, 2),
            ocr_policy: OcrPolicy::default(),
            fault_policy: FaultPolicy::default(),
            accelerator: Accelerator::default(),
            images_scale: 1.0,
            generate_page_images: false,
            max_rendered_pixels: 2000,
            queue_depth: 2,
            batch_wait_ms: 50,
            stage_timeout_secs: 120,
            pages: PageSelection::default(),
            page_separator: PageSeparator::default(),
            password: None,
            download_timeout_secs: 120,
            vlm: VlmSettings::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("layout", &self.layout)
            .field("ocr", &self.ocr)
            .field("table_structure", &self.table_structure)
            .field("ocr_policy", &self.ocr_policy)
            .field("fault_policy", &self.fault_policy)
            .field("accelerator", &self.accelerator)
            .field("images_scale", &self.images_scale)
            .field("generate_page_images", &self.generate_page_images)
            .field("queue_depth", &self.queue_depth)
            .field("batch_wait_ms", &self.batch_wait_ms)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("pages", &self.pages)
            .field("vlm", &self.vlm)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Per-page archive service: images on, large layout batches.
    pub fn archive() -> PipelineConfigBuilder {
        Self::builder()
            .generate_page_images(true)
            .images_scale(1.0)
            .layout(StageSettings::new(64, 1))
            .ocr(StageSettings::new(4, 1))
            .enable(StageKind::Ocr, false)
            .table_structure(StageSettings::new(4, 1))
            .accelerator(Accelerator::Device("cuda".into()))
    }

    /// Full-document Markdown service: images off, small batches.
    pub fn markdown() -> PipelineConfigBuilder {
        Self::builder()
            .generate_page_images(false)
            .layout(StageSettings::new(8, 1))
            .ocr(StageSettings::new(1, 1))
            .enable(StageKind::Ocr, false)
            .table_structure(StageSettings::new(1, 1))
            .accelerator(Accelerator::Device("cuda".into()))
    }

    /// Settings for one stage.
    pub fn stage(&self, kind: StageKind) -> &StageSettings {
        match kind {
            StageKind::Layout => &self.layout,
            StageKind::Ocr => &self.ocr,
            StageKind::TableStructure => &self.table_structure,
        }
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Capacity of a stage's input queue: `queue_depth × batch_size`.
    pub fn queue_capacity(&self, kind: StageKind) -> usize {
        (self.queue_depth * self.stage(kind).batch_size).max(1)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn layout(mut self, settings: StageSettings) -> Self {
        self.config.layout = settings;
        self
    }

    pub fn ocr(mut self, settings: StageSettings) -> Self {
        self.config.ocr = settings;
        self
    }

    pub fn table_structure(mut self, settings: StageSettings) -> Self {
        self.config.table_structure = settings;
        self
    }

    /// Enable or disable one stage, keeping its batch settings.
    pub fn enable(mut self, kind: StageKind, enabled: bool) -> Self {
        match kind {
            StageKind::Layout => self.config.layout.enabled = enabled,
            StageKind::Ocr => self.config.ocr.enabled = enabled,
            StageKind::TableStructure => self.config.table_structure.enabled = enabled,
        }
        self
    }

    pub fn ocr_policy(mut self, policy: OcrPolicy) -> Self {
        self.config.ocr_policy = policy;
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.config.fault_policy = policy;
        self
    }

    pub fn accelerator(mut self, accelerator: Accelerator) -> Self {
        self.config.accelerator = accelerator;
        self
    }

    pub fn images_scale(mut self, scale: f32) -> Self {
        self.config.images_scale = scale.clamp(0.25, 8.0);
        self
    }

    pub fn generate_page_images(mut self, v: bool) -> Self {
        self.config.generate_page_images = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.config.queue_depth = n.max(1);
        self
    }

    pub fn batch_wait_ms(mut self, ms: u64) -> Self {
        self.config.batch_wait_ms = ms;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout_secs = secs;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.vlm.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.vlm.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.vlm.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.vlm.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.vlm.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.vlm.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.vlm.retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.vlm.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConvertError> {
        let c = &self.config;
        for kind in StageKind::ALL {
            let s = c.stage(kind);
            if s.enabled && (s.batch_size == 0 || s.workers == 0) {
                return Err(ConvertError::InvalidConfig(format!(
                    "{kind} stage needs batch_size ≥ 1 and workers ≥ 1, got {}/{}",
                    s.batch_size, s.workers
                )));
            }
        }
        if c.stage_timeout_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "stage timeout must be ≥ 1s".into(),
            ));
        }
        if let Accelerator::Device(name) = &c.accelerator {
            if name.trim().is_empty() {
                return Err(ConvertError::InvalidConfig(
                    "accelerator device name must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Specifies which pages of the document to convert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 1-based page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let in_range = |p: usize| p >= 1 && p <= total_pages;
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => Some(*p).filter(|&p| in_range(p)).into_iter().collect(),
            PageSelection::Range(start, end) => ((*start).max(1)..=(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages.iter().copied().filter(|&p| in_range(p)).collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// How to separate pages in the assembled Markdown output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before page `page_num` (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}
