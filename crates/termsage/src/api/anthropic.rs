//! Anthropic Messages API (`/v1/messages`, `/v1/models`).
//!
//! System messages are lifted out of the message list into the top-level
//! `system` field. Streaming uses typed SSE events; usage arrives in two
//! parts (`message_start` carries input tokens, `message_delta` the final
//! output count), which the caller merges.

use crate::api::provider::{
    BoxFuture, Capabilities, ChunkStream, PromptRequest, ProviderAdapter, ProviderError,
    ProviderKind, StreamEvent, TokenUsage,
};
use crate::api::retry::{classify_transport, ensure_success};
use crate::api::streaming::{line_stream, sse_data};
use crate::api::usage::{ModelPricing, pricing_for_model};
use crate::api::{http_client, normalize_base_url};
use crate::config::ProviderConfig;
use crate::error::ConfigError;
use crate::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const API_VERSION: &str = "2023-06-01";
/// `max_tokens` is mandatory on this API.
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    pricing: Option<ModelPricing>,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a ChatMessage>,
    stream: bool,
}

/// Both the SSE event payloads and the non-streaming response body.
#[derive(Deserialize, Debug)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    message: Option<WireMessage>,
    delta: Option<WireDelta>,
    usage: Option<WireUsage>,
    #[serde(default)]
    content: Vec<WireBlock>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct WireMessage {
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
struct WireDelta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
        }
    }
}

#[derive(Deserialize, Debug)]
struct WireError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Deserialize, Debug)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize, Debug)]
struct ModelEntry {
    id: String,
}

impl AnthropicAdapter {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, ConfigError> {
        let timeout = config.timeout().unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            name: name.to_string(),
            client: http_client(timeout)?,
            base_url: normalize_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
            api_key: config.resolve_api_key(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout,
            pricing: config.pricing,
        })
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Unavailable(format!("{}: no API key configured", self.name))
        })
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let key = self.key()?;
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let resp = ensure_success(&self.name, resp).await?;
        let list: ModelList = resp.json().await.map_err(|e| {
            ProviderError::Unavailable(format!("{}: malformed /v1/models response: {e}", self.name))
        })?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn start(&self, request: PromptRequest, stream: bool) -> Result<ChunkStream, ProviderError> {
        let key = self.key()?;
        let body = messages_body(&request, stream);
        debug!(
            provider = %self.name,
            model = %request.model,
            messages = body.messages.len(),
            stream,
            "messages request"
        );

        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        if !stream {
            builder = builder.timeout(self.timeout);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let resp = ensure_success(&self.name, resp).await?;

        if stream {
            return Ok(line_stream(self.name.clone(), resp, parse_sse_line));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let mut events = parse_event(&text)?;
        events.push(StreamEvent::Done);
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

fn messages_body(request: &PromptRequest, stream: bool) -> MessagesBody<'_> {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    MessagesBody {
        model: &request.model,
        max_tokens: request
            .max_output_tokens
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages: request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect(),
        stream,
    }
}

/// Decode one SSE line. `event:` lines are redundant with the payload's
/// `type` field and are skipped.
pub fn parse_sse_line(line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    match sse_data(line) {
        Some(data) => parse_event(data),
        None => Ok(Vec::new()),
    }
}

fn parse_event(data: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let event: WireEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            warn!("skipping malformed anthropic event: {e}");
            return Ok(Vec::new());
        }
    };

    let events = match event.kind.as_str() {
        "message_start" => event
            .message
            .and_then(|m| m.usage)
            .map(|u| vec![StreamEvent::Usage(u.into())])
            .unwrap_or_default(),
        "content_block_delta" => match event.delta {
            Some(WireDelta {
                kind: Some(kind),
                text: Some(text),
            }) if kind == "text_delta" && !text.is_empty() => vec![StreamEvent::TextDelta(text)],
            _ => Vec::new(),
        },
        "message_delta" => event
            .usage
            .map(|u| vec![StreamEvent::Usage(u.into())])
            .unwrap_or_default(),
        "message_stop" => vec![StreamEvent::Done],
        "error" => {
            let (kind, message) = event
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or_else(|| ("error".into(), "unknown error".into()));
            return Err(match kind.as_str() {
                "authentication_error" | "permission_error" => {
                    ProviderError::Auth(format!("anthropic: {message}"))
                }
                "rate_limit_error" => ProviderError::RateLimited { retry_after: None },
                _ => ProviderError::Unavailable(format!("anthropic {kind}: {message}")),
            });
        }
        // Non-streaming response body.
        "message" => {
            let mut events: Vec<StreamEvent> = event
                .content
                .into_iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text)
                .filter(|t| !t.is_empty())
                .map(StreamEvent::TextDelta)
                .collect();
            if let Some(usage) = event.usage {
                events.push(StreamEvent::Usage(usage.into()));
            }
            events
        }
        // ping, content_block_start, content_block_stop
        _ => Vec::new(),
    };
    Ok(events)
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn pricing(&self, model: &str) -> Option<ModelPricing> {
        Some(self.pricing.unwrap_or_else(|| pricing_for_model(model)))
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move { self.key().map(|_| ()) })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
        Box::pin(self.fetch_models())
    }

    fn send(
        &self,
        request: &PromptRequest,
        stream: bool,
    ) -> BoxFuture<'_, Result<ChunkStream, ProviderError>> {
        let request = request.clone();
        Box::pin(self.start(request, stream))
    }
}
