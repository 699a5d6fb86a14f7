//! Inference service contract and its VLM-backed implementation.
//!
//! The pipeline only ever talks to an [`InferenceService`]: page payload
//! plus optional rubric in, raw response text out. Parsing and validating
//! that text is the dispatcher's job ([`crate::pipeline::dispatch`]), so an
//! implementation never has to guess at a partial result.
//!
//! [`VisionInference`] drives any `edgequake_llm` provider. Transient
//! failures are retried with exponential backoff
//! (`retry_backoff_ms * 2^attempt`). Quota and authentication failures are
//! returned immediately: retrying them only burns more quota.

use crate::config::PipelineConfig;
use crate::error::{ExamScanError, PageError};
use crate::model::RubricCriterion;
use crate::pipeline::encode::image_payload;
use crate::prompts::{rubric_context, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// What is sent for one page.
#[derive(Debug, Clone)]
pub enum PagePayload {
    Image { mime_type: String, bytes: Vec<u8> },
    Text(String),
}

/// One analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub page_id: String,
    pub payload: PagePayload,
    pub rubric: Option<Vec<RubricCriterion>>,
    pub force_rescan: bool,
}

/// External page-analysis service.
///
/// Returns the raw response body; an `Err` must already be classified
/// (quota vs. transient vs. auth).
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PageError>;
}

/// [`InferenceService`] backed by a vision LLM.
pub struct VisionInference {
    provider: Arc<dyn LLMProvider>,
    config: PipelineConfig,
}

impl VisionInference {
    pub fn new(provider: Arc<dyn LLMProvider>, config: PipelineConfig) -> Self {
        Self { provider, config }
    }

    /// Resolve the provider from the config and environment.
    ///
    /// 1. `config.provider` as-is
    /// 2. `config.provider_name` + `config.model`
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set
    /// 4. OpenAI when `OPENAI_API_KEY` is set
    /// 5. `ProviderFactory::from_env()` auto-detection
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ExamScanError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config.clone()))
    }

    fn build_messages(&self, request: &AnalysisRequest) -> Vec<ChatMessage> {
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let mut messages = vec![ChatMessage::system(system_prompt)];
        if let Some(ref criteria) = request.rubric {
            if !criteria.is_empty() {
                messages.push(ChatMessage::system(rubric_context(criteria)));
            }
        }

        match &request.payload {
            PagePayload::Image { mime_type, bytes } => {
                messages.push(ChatMessage::user_with_images(
                    "",
                    vec![image_payload(bytes, mime_type)],
                ));
            }
            PagePayload::Text(text) => {
                messages.push(ChatMessage::user(format!(
                    "Extracted document text:\n\n\"\"\"{text}\"\"\""
                )));
            }
        }
        messages
    }
}

#[async_trait]
impl InferenceService for VisionInference {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PageError> {
        let start = Instant::now();
        let messages = self.build_messages(request);
        let options = build_options(&self.config);
        let max_retries = self.config.max_retries;

        let mut last_err = String::new();
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    request.page_id, attempt, max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Page {}: {} input tokens, {} output tokens, {:?}",
                        request.page_id,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    let detail = e.to_string();
                    match classify_failure(&detail) {
                        FailureKind::Quota => return Err(PageError::QuotaExhausted { detail }),
                        FailureKind::Auth => return Err(PageError::AuthFailed { detail }),
                        FailureKind::Transient => {
                            warn!(
                                "Page {}: attempt {} failed: {}",
                                request.page_id,
                                attempt + 1,
                                detail
                            );
                            last_err = detail;
                        }
                    }
                }
            }
        }

        Err(PageError::Transient {
            retries: max_retries,
            detail: last_err,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Quota,
    Auth,
    Transient,
}

/// Providers surface HTTP failures as text, so classification is by message.
fn classify_failure(message: &str) -> FailureKind {
    let m = message.to_ascii_lowercase();
    if m.contains("429")
        || m.contains("quota")
        || m.contains("rate limit")
        || m.contains("rate_limit")
        || m.contains("resource_exhausted")
        || m.contains("insufficient_quota")
    {
        FailureKind::Quota
    } else if m.contains("401")
        || m.contains("403")
        || m.contains("unauthorized")
        || m.contains("forbidden")
        || m.contains("invalid api key")
        || m.contains("authentication")
    {
        FailureKind::Auth
    } else {
        FailureKind::Transient
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExamScanError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExamScanError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, ExamScanError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
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

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExamScanError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or GEMINI_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn classify_quota() {
        assert_eq!(
            classify_failure("HTTP 429 Too Many Requests"),
            FailureKind::Quota
        );
        assert_eq!(
            classify_failure("RESOURCE_EXHAUSTED: Quota exceeded"),
            FailureKind::Quota
        );
    }

    #[test]
    fn classify_auth() {
        assert_eq!(classify_failure("401 Unauthorized"), FailureKind::Auth);
        assert_eq!(classify_failure("Invalid API key provided"), FailureKind::Auth);
    }

    #[test]
    fn classify_transient() {
        assert_eq!(
            classify_failure("connection reset by peer"),
            FailureKind::Transient
        );
        assert_eq!(classify_failure("502 Bad Gateway"), FailureKind::Transient);
    }
}
