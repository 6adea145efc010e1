//! The backend abstraction: one [`ProviderAdapter`] per language-model service.
//!
//! Every adapter exposes the same call shape regardless of what the backend
//! supports natively. A non-streaming backend still answers `send` with a
//! [`ChunkStream`]; it just yields the whole text as a single delta.

use crate::ChatMessage;
use crate::api::usage::ModelPricing;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by adapter methods (keeps the trait object safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazily polled response stream. Finite; ends after [`StreamEvent::Done`]
/// or the first error. Dropping it cancels the underlying request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

// ── Kinds and capabilities ─────────────────────────────────────────

/// The closed set of backend families an adapter can be built for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama daemon.
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint.
    #[serde(alias = "openai-compatible")]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
}

impl ProviderKind {
    /// Local backends are free and need no credentials.
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderKind::Ollama)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// What an adapter can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub chat: bool,
    pub stream: bool,
    pub list_models: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        chat: true,
        stream: true,
        list_models: true,
    };

    pub const CHAT_ONLY: Capabilities = Capabilities {
        chat: true,
        stream: false,
        list_models: false,
    };
}

// ── Errors ─────────────────────────────────────────────────────────

/// Provider-local failure. Every variant is recovered by falling back to the
/// next provider within the same turn.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(": retry after {}s", delay.as_secs()),
        None => String::new(),
    }
}

impl ProviderError {
    /// Short label used in logs and health bookkeeping.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimited { .. } => "rate_limited",
        }
    }
}

// ── Requests and stream events ─────────────────────────────────────

/// Token counts reported by a backend. Backends that split reporting across
/// several events (Anthropic) send partial values that are merged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        }
    }

    /// Fold a later partial report into this one. Present values win.
    pub fn merge(&mut self, other: TokenUsage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }
}

/// A single event from a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text delta.
    TextDelta(String),
    /// Token usage, possibly partial.
    Usage(TokenUsage),
    /// The backend finished the response.
    Done,
}

/// The prompt sent to a backend for one attempt.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Upper bound on generated tokens, if the caller wants one.
    pub max_output_tokens: Option<u32>,
}

impl PromptRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_output_tokens: None,
        }
    }

    /// Total characters across all message contents.
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

// ── Adapter trait ──────────────────────────────────────────────────

/// Uniform wrapper around one language-model backend.
///
/// Implementations must never panic on backend misbehaviour; every failure
/// maps to a [`ProviderError`] variant so the orchestrator can fall back.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl ProviderAdapter for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn kind(&self) -> ProviderKind { ProviderKind::Ollama }
///     fn capabilities(&self) -> Capabilities { Capabilities::CHAT_ONLY }
///     fn default_model(&self) -> &str { "echo-1" }
///     fn probe(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
///         Box::pin(async { Ok(()) })
///     }
///     fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
///         Box::pin(async { Ok(vec!["echo-1".into()]) })
///     }
///     fn send(&self, request: &PromptRequest, _stream: bool)
///         -> BoxFuture<'_, Result<ChunkStream, ProviderError>>
///     {
///         let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
///         Box::pin(async move { Ok(single_response(last, None)) })
///     }
/// }
/// ```
pub trait ProviderAdapter: Send + Sync {
    /// Configured provider name (the key used in `provider_priority`).
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Model used when the caller does not pick one.
    fn default_model(&self) -> &str;

    /// Per-request timeout; also bounds the wait for each stream chunk.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Pricing for cost accounting. `None` means the backend is free.
    fn pricing(&self, model: &str) -> Option<ModelPricing> {
        let _ = model;
        None
    }

    /// Cheap liveness probe: a local ping or a credential presence check.
    fn probe(&self) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Model identifiers the backend offers.
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>>;

    /// Start a response. Connection and HTTP status failures surface here;
    /// failures after the first byte surface as stream items.
    fn send(
        &self,
        request: &PromptRequest,
        stream: bool,
    ) -> BoxFuture<'_, Result<ChunkStream, ProviderError>>;
}

/// Wrap a complete response as a two- or three-event stream.
pub fn single_response(text: String, usage: Option<TokenUsage>) -> ChunkStream {
    let mut events = vec![Ok(StreamEvent::TextDelta(text))];
    if let Some(usage) = usage {
        events.push(Ok(StreamEvent::Usage(usage)));
    }
    events.push(Ok(StreamEvent::Done));
    Box::pin(futures::stream::iter(events))
}
