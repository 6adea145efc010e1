//! Configuration for the [`ProviderOrchestrator`](crate::agent::orchestrator::ProviderOrchestrator).
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Override fields in TOML, through struct update syntax, or
//! with the builder methods.
//!
//! # Examples
//!
//! From TOML:
//!
//! ```ignore
//! let config = TermSageConfig::from_toml_str(r#"
//!     max_tokens = 8192
//!     provider_priority = ["ollama", "anthropic"]
//!
//!     [providers.anthropic]
//!     kind = "anthropic"
//!     model = "claude-3-5-haiku-latest"
//! "#)?;
//! ```
//!
//! From a hardware tier, with builder overrides:
//!
//! ```ignore
//! let config = PerformanceTier::Basic
//!     .config()
//!     .with_retry_count(2)
//!     .with_model("ollama:llama3.2:1b");
//! ```

use crate::api::provider::ProviderKind;
use crate::api::usage::ModelPricing;
use crate::context::findings::FindingKind;
use crate::context::store::StoreConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

// ── Provider config ────────────────────────────────────────────────

/// Connection settings for one backend.
///
/// Unset fields fall back to the defaults of `kind` (base URL, model,
/// credential environment variable, timeout).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Literal API key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Default model for this provider.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Price override (USD per 1M tokens) for cost accounting.
    #[serde(default)]
    pub pricing: Option<ModelPricing>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: None,
            timeout_secs: None,
            pricing: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Environment variable consulted for the API key, if any.
    pub fn api_key_env_name(&self) -> Option<&str> {
        if let Some(var) = self.api_key_env.as_deref() {
            return Some(var);
        }
        match self.kind {
            ProviderKind::Ollama => None,
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }

    /// The API key from config, then from the environment. Empty values
    /// count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Some(key.to_string());
        }
        self.api_key_env_name()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

// ── Top-level config ───────────────────────────────────────────────

/// Orchestrator and context settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TermSageConfig {
    /// Context token budget.
    pub max_tokens: usize,
    /// Fraction of `max_tokens` above which compression runs. In `(0, 1]`.
    pub compression_threshold: f64,
    /// Most recent messages that are never compressed.
    pub min_messages: usize,
    /// Provider names in the order they are tried.
    pub provider_priority: Vec<String>,
    /// Stream responses by default.
    pub stream: bool,
    /// Maximum provider attempts per turn. At least 1.
    pub retry_count: u32,
    /// Messages folded per compression step.
    pub batch_size: usize,
    /// Messages holding a finding of this kind or a higher-ranked one are
    /// never compressed.
    pub pinned_kind: FindingKind,
    /// Overall bound on the concurrent availability probes.
    pub probe_timeout_secs: u64,
    /// How long a probe result is reused across turns. `0` probes before
    /// every turn; the result then holds for that turn only.
    pub availability_ttl_secs: u64,
    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,
    /// Initial model spec (`provider:model` or `model`).
    pub model: Option<String>,
    /// Per-provider settings keyed by the names used in `provider_priority`.
    /// A name that is also a provider kind (`ollama`, `openai`, `anthropic`)
    /// needs no entry.
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for TermSageConfig {
    fn default() -> Self {
        PerformanceTier::Medium.config()
    }
}

impl TermSageConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: TermSageConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for `name`: the explicit entry, or the kind defaults when the
    /// name is itself a provider kind.
    pub fn provider(&self, name: &str) -> Option<ProviderConfig> {
        if let Some(config) = self.providers.get(name) {
            return Some(config.clone());
        }
        let kind = match name {
            "ollama" => ProviderKind::Ollama,
            "openai" | "openai-compatible" => ProviderKind::OpenAi,
            "anthropic" => ProviderKind::Anthropic,
            _ => return None,
        };
        Some(ProviderConfig::new(kind))
    }

    /// Check invariants that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        let mut seen = HashSet::new();
        for name in &self.provider_priority {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "provider '{name}' listed twice in provider_priority"
                )));
            }
            if self.provider(name).is_none() {
                return Err(ConfigError::Validation(format!(
                    "unknown provider '{name}': add a [providers.{name}] entry with a kind"
                )));
            }
        }
        Ok(())
    }

    /// The numeric and context checks of [`validate`](Self::validate),
    /// without resolving provider names.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if !(self.compression_threshold > 0.0 && self.compression_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "compression_threshold must be in (0, 1], got {}",
                self.compression_threshold
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Validation("max_tokens must be > 0".into()));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::Validation("retry_count must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be >= 1".into()));
        }
        if self.probe_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "probe_timeout_secs must be > 0".into(),
            ));
        }
        if self.provider_priority.is_empty() {
            return Err(ConfigError::Validation(
                "provider_priority must name at least one provider".into(),
            ));
        }
        Ok(())
    }

    /// Context store settings derived from this config.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_tokens: self.max_tokens,
            compression_threshold: self.compression_threshold,
            min_messages: self.min_messages,
            batch_size: self.batch_size,
            pinned_kind: self.pinned_kind,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn availability_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_ttl_secs)
    }

    // ── Builder methods ──

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: f64) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_min_messages(mut self, n: usize) -> Self {
        self.min_messages = n;
        self
    }

    pub fn with_provider_priority<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.provider_priority = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provider(mut self, name: impl Into<String>, config: ProviderConfig) -> Self {
        self.providers.insert(name.into(), config);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_retry_count(mut self, n: u32) -> Self {
        self.retry_count = n;
        self
    }

    pub fn with_availability_ttl_secs(mut self, secs: u64) -> Self {
        self.availability_ttl_secs = secs;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_pinned_kind(mut self, kind: FindingKind) -> Self {
        self.pinned_kind = kind;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, spec: impl Into<String>) -> Self {
        self.model = Some(spec.into());
        self
    }
}

// ── Performance tiers ──────────────────────────────────────────────

/// Hardware-derived presets for context and provider settings. Detecting
/// the tier is the caller's job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    High,
    Medium,
    Basic,
    Minimal,
}

impl PerformanceTier {
    /// The preset configuration for this tier.
    pub fn config(self) -> TermSageConfig {
        let (max_tokens, compression_threshold, min_messages, priority, retry_count): (
            usize,
            f64,
            usize,
            &[&str],
            u32,
        ) = match self {
            PerformanceTier::High => (8192, 0.85, 6, &["ollama", "anthropic", "openai"], 3),
            PerformanceTier::Medium => (4096, 0.75, 4, &["ollama", "openai", "anthropic"], 2),
            PerformanceTier::Basic => (2048, 0.7, 3, &["ollama", "openai"], 1),
            PerformanceTier::Minimal => (1024, 0.6, 2, &["ollama"], 1),
        };
        TermSageConfig {
            max_tokens,
            compression_threshold,
            min_messages,
            provider_priority: priority.iter().map(|s| s.to_string()).collect(),
            stream: true,
            retry_count,
            batch_size: 2,
            pinned_kind: FindingKind::Credential,
            probe_timeout_secs: 3,
            availability_ttl_secs: 10,
            system_prompt: None,
            model: None,
            providers: BTreeMap::new(),
        }
    }
}

impl std::str::FromStr for PerformanceTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(PerformanceTier::High),
            "medium" => Ok(PerformanceTier::Medium),
            "basic" => Ok(PerformanceTier::Basic),
            "minimal" => Ok(PerformanceTier::Minimal),
            other => Err(ConfigError::Validation(format!(
                "unknown performance tier '{other}' (expected high, medium, basic or minimal)"
            ))),
        }
    }
}
