//! Vision-LLM OCR backend.
//!
//! Each page bitmap is sent to the configured provider as a base64 PNG and
//! the returned Markdown is split into regions on blank lines. The provider
//! is resolved on the first batch, so a conversion whose pages all carry a
//! text layer never needs LLM credentials.
//!
//! ## Retry Strategy
//!
//! Provider errors are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt - 1)`): with a 500 ms base and 3 retries the
//! waits are 500 ms → 1 s → 2 s. A page whose retries run out becomes a page
//! fault; it does not fail the batch.

use crate::config::VlmSettings;
use crate::error::{ConvertError, StageError};
use crate::export::{image::to_image_data, markdown::parse_table};
use crate::model::{BoundingBox, Provenance, Region, RegionKind};
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::stage::{ItemResult, StageBackend, StageItem};
use crate::prompts::OCR_SYSTEM_PROMPT;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::future::{join_all, BoxFuture};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// OCR through a vision-capable LLM.
pub struct VlmOcr {
    settings: VlmSettings,
    provider: Mutex<Option<Arc<dyn LLMProvider>>>,
}

impl VlmOcr {
    pub fn new(settings: VlmSettings) -> Self {
        let provider = Mutex::new(settings.provider.clone());
        Self { settings, provider }
    }

    fn provider(&self) -> Result<Arc<dyn LLMProvider>, StageError> {
        let mut slot = self
            .provider
            .lock()
            .map_err(|_| StageError::Unavailable("provider lock poisoned".into()))?;
        if let Some(provider) = slot.as_ref() {
            return Ok(Arc::clone(provider));
        }
        let provider = resolve_provider(&self.settings).map_err(|e| StageError::Unavailable(e.to_string()))?;
        *slot = Some(Arc::clone(&provider));
        Ok(provider)
    }

    async fn transcribe(&self, provider: &Arc<dyn LLMProvider>, item: &StageItem) -> ItemResult {
        let start = Instant::now();
        let bitmap = item.image.as_deref().ok_or("page has no bitmap to transcribe")?;
        let image = to_image_data(bitmap).map_err(|e| format!("image encoding failed: {e}"))?;

        let system_prompt = self.settings.system_prompt.as_deref().unwrap_or(OCR_SYSTEM_PROMPT);
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images("", vec![image]),
        ];
        let options = build_options(&self.settings);

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let backoff = self.settings.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Page {}: OCR retry {}/{} after {}ms",
                    item.page, attempt, self.settings.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Page {}: {} input tokens, {} output tokens, {:?}",
                        item.page,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    let markdown = clean_markdown(&response.content);
                    let page_box = BoundingBox::new(0.0, 0.0, item.width, item.height);
                    let regions = to_regions(&markdown, page_box);
                    if regions.is_empty() {
                        return Ok(item.regions.clone());
                    }
                    return Ok(regions);
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    warn!("Page {}: OCR attempt {} failed: {}", item.page, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(format!(
            "OCR failed after {} retries: {}",
            self.settings.max_retries,
            last_err.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

impl StageBackend for VlmOcr {
    fn name(&self) -> &str {
        "vlm-ocr"
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move {
            let provider = self.provider()?;
            let provider = &provider;
            Ok(join_all(items.iter().map(|item| self.transcribe(provider, item))).await)
        })
    }
}

/// Split OCR Markdown into regions, one per blank-line separated block.
///
/// Every region gets the page box; the transcription carries no geometry.
pub fn to_regions(markdown: &str, page_box: BoundingBox) -> Vec<Region> {
    markdown
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(|block| {
            if let Some(heading) = block.strip_prefix('#') {
                let text = heading.trim_start_matches('#').trim();
                return Region::new(RegionKind::Heading, page_box, Some(text.to_string()), Provenance::Ocr);
            }
            if block.lines().all(|l| l.trim_start().starts_with('|')) {
                let mut region = Region::new(RegionKind::Table, page_box, Some(block.to_string()), Provenance::Ocr);
                region.table = parse_table(block, page_box);
                return region;
            }
            Region::new(RegionKind::Text, page_box, Some(block.to_string()), Provenance::Ocr)
        })
        .collect()
}

fn build_options(settings: &VlmSettings) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(settings.temperature),
        max_tokens: Some(settings.max_tokens),
        ..Default::default()
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ConvertError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| ConvertError::ProviderNotConfigured {
        provider: provider_name.to_string(),
        hint: format!("{e}"),
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. a pre-built provider in the settings
/// 2. `provider_name` plus `model`
/// 3. `EDGEQUAKE_LLM_PROVIDER` and `EDGEQUAKE_MODEL`, when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is present
/// 5. whatever [`ProviderFactory::from_env`] detects
pub fn resolve_provider(settings: &VlmSettings) -> Result<Arc<dyn LLMProvider>, ConvertError> {
    if let Some(ref provider) = settings.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = settings.provider_name {
        let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|key| !key.is_empty()) {
        let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| ConvertError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: format!(
            "No LLM provider could be auto-detected from environment.\n\
            Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
            Error: {}",
            e
        ),
    })?;

    Ok(llm_provider)
}
