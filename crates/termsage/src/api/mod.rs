//! Backend layer: the adapter trait, its HTTP implementations, and the
//! pieces they share.
//!
//! - [`provider`]: [`ProviderAdapter`], the failure taxonomy and stream
//!   events.
//! - [`ollama`], [`openai`], [`anthropic`]: concrete adapters.
//! - [`streaming`]: line decoding for SSE and NDJSON bodies.
//! - [`retry`]: HTTP status classification and rate-limit backoff.
//! - [`router`]: `provider:model` specs.
//! - [`usage`]: turn IDs, pricing tables, usage records and the
//!   [`CostTracker`].

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod router;
pub mod streaming;
pub mod usage;

pub use provider::{
    BoxFuture, Capabilities, ChunkStream, PromptRequest, ProviderAdapter, ProviderError,
    ProviderKind, StreamEvent, TokenUsage,
};
pub use router::ModelSpec;
pub use usage::{CostTracker, ModelPricing, UsageRecord, pricing_for_model};

use crate::config::ProviderConfig;
use crate::error::ConfigError;
use std::time::Duration;

/// Build the adapter for a configured provider.
pub fn build_adapter(
    name: &str,
    config: &ProviderConfig,
) -> Result<Box<dyn ProviderAdapter>, ConfigError> {
    let adapter: Box<dyn ProviderAdapter> = match config.kind {
        ProviderKind::Ollama => Box::new(ollama::OllamaAdapter::new(name, config)?),
        ProviderKind::OpenAi => Box::new(openai::OpenAiAdapter::new(name, config)?),
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicAdapter::new(name, config)?),
    };
    Ok(adapter)
}

/// Shared HTTP client settings. `timeout` bounds connecting and each read,
/// not the whole body, so long streams are not cut off.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .user_agent(concat!("termsage/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .read_timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
