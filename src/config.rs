//! Configuration for the reconciliation pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Setters clamp out-of-range values;
//! [`PipelineConfigBuilder::build`] rejects combinations that cannot work.

use crate::error::ExamScanError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Configuration for ingestion, analysis and batch scheduling.
///
/// # Example
/// ```rust
/// use edgequake_examscan::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .model("gpt-4.1-mini")
///     .max_retries(1)
///     .stop_on_quota_exhausted(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Retries on a *transient* service failure. Default: 2.
    ///
    /// Quota, authentication and malformed-response failures are never
    /// retried; the page goes straight to `error`.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom system prompt. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Longest edge of the inline preview thumbnail, in pixels. Default: 320.
    pub preview_max_px: u32,

    /// Longest edge of rasterised PDF pages, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// User password for encrypted PDFs.
    pub pdf_password: Option<String>,

    /// Longest task/subtask label accepted verbatim. Default: 4.
    pub max_task_label_len: usize,

    /// Log a warning every N seconds while one analysis call is in flight.
    /// 0 disables the watchdog. It never cancels the call. Default: 60.
    pub slow_call_warn_secs: u64,

    /// Request a cooperative stop after a page fails with quota exhaustion.
    /// Default: false.
    pub stop_on_quota_exhausted: bool,

    /// Per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            system_prompt: None,
            preview_max_px: 320,
            max_rendered_pixels: 2000,
            pdf_password: None,
            max_task_label_len: 4,
            slow_call_warn_secs: 60,
            stop_on_quota_exhausted: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("preview_max_px", &self.preview_max_px)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("max_task_label_len", &self.max_task_label_len)
            .field("slow_call_warn_secs", &self.slow_call_warn_secs)
            .field("stop_on_quota_exhausted", &self.stop_on_quota_exhausted)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
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
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn preview_max_px(mut self, px: u32) -> Self {
        self.config.preview_max_px = px.clamp(64, 2048);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pdf_password(mut self, pwd: impl Into<String>) -> Self {
        self.config.pdf_password = Some(pwd.into());
        self
    }

    pub fn max_task_label_len(mut self, n: usize) -> Self {
        self.config.max_task_label_len = n;
        self
    }

    pub fn slow_call_warn_secs(mut self, secs: u64) -> Self {
        self.config.slow_call_warn_secs = secs;
        self
    }

    pub fn stop_on_quota_exhausted(mut self, v: bool) -> Self {
        self.config.stop_on_quota_exhausted = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ExamScanError> {
        let c = &self.config;
        if c.max_task_label_len == 0 {
            return Err(ExamScanError::InvalidConfig(
                "max_task_label_len must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(ExamScanError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}
