//! Configuration types for session extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The config is an explicit value handed
//! to the dispatcher at construction time; nothing inside the pipeline reads
//! credentials or endpoints from the process environment.

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use crate::record::Field;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for extracting session records from one or more documents.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_sessions::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_chars(3000)
///     .max_retries(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Character budget per unit. Range: 500–20000. Default: 4000.
    ///
    /// Observed working values sit between 1500 and 6000. Smaller units give
    /// the model less to confuse; larger units split fewer sessions.
    pub max_chars: usize,

    /// Longest line accepted as a session title. Default: 200.
    pub max_title_len: usize,

    /// How many lines above a marker are scanned for a title. Default: 5.
    pub title_lookback: usize,

    /// Window (in characters) searched backwards for a marker when the
    /// chunker falls back to fixed-size slicing. Default: 500.
    pub fallback_window: usize,

    /// Literal labels that structure a program page.
    pub markers: SegmentationMarkers,

    /// Extra regexes for page headers/footers to strip before boundary search.
    pub furniture_patterns: Vec<String>,

    /// A line seen next to page numbers/timestamps at least this many times
    /// is treated as a running header/footer. Default: 2.
    pub furniture_min_repeats: usize,

    /// Fields that must be present (as strings) for a record to survive.
    /// Default: `session_code`, `title`.
    pub required_fields: Vec<Field>,

    /// Units dispatched at once. Default: 1 (sequential).
    ///
    /// Sequential mode also lets an overview resolved from one unit's reply
    /// be carried to the next unit of the same session.
    pub concurrency: usize,

    /// Only dispatch the first N units. Default: None (all units).
    pub unit_limit: Option<usize>,

    /// LLM model identifier. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "azure", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the service may generate per unit. Default: 4000.
    pub max_tokens: usize,

    /// Retries after the first attempt of a unit. Default: 3.
    pub max_retries: u32,

    /// Delay before a retry in milliseconds. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Whether the retry delay is fixed or doubles per retry. Default: Fixed.
    pub backoff: Backoff,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Custom system prompt. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Per-unit progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            max_title_len: 200,
            title_lookback: 5,
            fallback_window: 500,
            markers: SegmentationMarkers::default(),
            furniture_patterns: Vec::new(),
            furniture_min_repeats: 2,
            required_fields: vec![Field::SessionCode, Field::Title],
            concurrency: 1,
            unit_limit: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            backoff: Backoff::default(),
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_chars", &self.max_chars)
            .field("max_title_len", &self.max_title_len)
            .field("title_lookback", &self.title_lookback)
            .field("markers", &self.markers)
            .field("required_fields", &self.required_fields)
            .field("concurrency", &self.concurrency)
            .field("unit_limit", &self.unit_limit)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("backoff", &self.backoff)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Per-call timeout as a `Duration`.
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.backoff.delay(self.retry_backoff_ms, retry)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn max_chars(mut self, n: usize) -> Self {
        self.config.max_chars = n;
        self
    }

    pub fn max_title_len(mut self, n: usize) -> Self {
        self.config.max_title_len = n.max(1);
        self
    }

    pub fn title_lookback(mut self, lines: usize) -> Self {
        self.config.title_lookback = lines;
        self
    }

    pub fn fallback_window(mut self, chars: usize) -> Self {
        self.config.fallback_window = chars;
        self
    }

    pub fn markers(mut self, markers: SegmentationMarkers) -> Self {
        self.config.markers = markers;
        self
    }

    pub fn furniture_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.furniture_patterns.push(pattern.into());
        self
    }

    pub fn furniture_min_repeats(mut self, n: usize) -> Self {
        self.config.furniture_min_repeats = n.max(1);
        self
    }

    pub fn required_fields(mut self, fields: Vec<Field>) -> Self {
        self.config.required_fields = fields;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn unit_limit(mut self, n: usize) -> Self {
        self.config.unit_limit = Some(n);
        self
    }

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

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if !(500..=20_000).contains(&c.max_chars) {
            return Err(ExtractError::InvalidConfig(format!(
                "max_chars must be 500–20000, got {}",
                c.max_chars
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.markers.session_label.trim().is_empty() {
            return Err(ExtractError::InvalidConfig(
                "session marker label must not be empty".into(),
            ));
        }
        for pattern in &c.furniture_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ExtractError::InvalidConfig(format!(
                    "furniture pattern {pattern:?} is not a valid regex: {e}"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums & marker set ───────────────────────────────────────────────────

/// How long to wait between attempts of the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backoff {
    /// The same delay before every retry. (default)
    #[default]
    Fixed,
    /// `base * 2^(retry-1)`: base → 2·base → 4·base …
    Exponential,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based) given a base delay.
    pub fn delay(&self, base_ms: u64, retry: u32) -> Duration {
        let ms = match self {
            Backoff::Fixed => base_ms,
            Backoff::Exponential => {
                let shift = retry.saturating_sub(1).min(16);
                base_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}

/// The literal labels a program page is built from.
///
/// The text-extraction collaborator is expected to keep these as substrings;
/// labels are matched case-sensitively at the start of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationMarkers {
    /// Label that precedes the session identifier, e.g. `Session Code PFL750`.
    pub session_label: String,
    /// Label of the venue line after which the overview paragraph starts.
    pub location_label: String,
    /// Labels of organisational fields; the overview ends at the first one.
    pub field_labels: Vec<String>,
}

impl Default for SegmentationMarkers {
    fn default() -> Self {
        Self {
            session_label: "Session Code".to_string(),
            location_label: "Room".to_string(),
            field_labels: vec![
                "Organizers".to_string(),
                "Chairperson".to_string(),
                "Time".to_string(),
                "Paper No.".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sequential_and_fixed() {
        let c = ExtractionConfig::default();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.backoff, Backoff::Fixed);
        assert_eq!(c.max_chars, 4000);
        assert_eq!(c.required_fields, vec![Field::SessionCode, Field::Title]);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        assert_eq!(Backoff::Fixed.delay(2000, 1), Duration::from_millis(2000));
        assert_eq!(Backoff::Fixed.delay(2000, 4), Duration::from_millis(2000));
    }

    #[test]
    fn exponential_backoff_doubles() {
        assert_eq!(Backoff::Exponential.delay(500, 1), Duration::from_millis(500));
        assert_eq!(Backoff::Exponential.delay(500, 2), Duration::from_millis(1000));
        assert_eq!(Backoff::Exponential.delay(500, 3), Duration::from_millis(2000));
    }

    #[test]
    fn build_rejects_tiny_budget() {
        let err = ExtractionConfig::builder().max_chars(10).build().unwrap_err();
        assert!(err.to_string().contains("max_chars"));
    }

    #[test]
    fn build_rejects_bad_furniture_regex() {
        let err = ExtractionConfig::builder()
            .furniture_pattern("(unclosed")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("furniture pattern"));
    }

    #[test]
    fn concurrency_never_zero() {
        let c = ExtractionConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }
}
