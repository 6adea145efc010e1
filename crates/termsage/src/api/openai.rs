//! OpenAI-compatible chat completions (`/chat/completions`, `/models`).
//!
//! Works against api.openai.com and any server that mirrors its wire format
//! (vLLM, LM Studio, llama.cpp). A custom `base_url` makes the API key
//! optional, since most self-hosted servers don't check it.

use crate::ChatMessage;
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
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    key_required: bool,
    model: String,
    timeout: Duration,
    pricing: Option<ModelPricing>,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize, Debug)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    /// Streaming responses.
    delta: Option<ChoiceContent>,
    /// Non-streaming responses.
    message: Option<ChoiceContent>,
}

#[derive(Deserialize, Debug)]
struct ChoiceContent {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct WireError {
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

impl OpenAiAdapter {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, ConfigError> {
        let timeout = config.timeout().unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            name: name.to_string(),
            client: http_client(timeout)?,
            base_url: normalize_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
            api_key: config.resolve_api_key(),
            key_required: config.base_url.is_none(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout,
            pricing: config.pricing,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn check_key(&self) -> Result<(), ProviderError> {
        if self.key_required && self.api_key.is_none() {
            return Err(ProviderError::Unavailable(format!(
                "{}: no API key configured",
                self.name
            )));
        }
        Ok(())
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        self.check_key()?;
        let resp = self
            .authorize(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let resp = ensure_success(&self.name, resp).await?;
        let list: ModelList = resp.json().await.map_err(|e| {
            ProviderError::Unavailable(format!("{}: malformed /models response: {e}", self.name))
        })?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn start(&self, request: PromptRequest, stream: bool) -> Result<ChunkStream, ProviderError> {
        self.check_key()?;
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: request.max_output_tokens,
        };
        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            stream,
            "chat completions request"
        );

        let mut builder = self
            .authorize(self.client.post(format!("{}/chat/completions", self.base_url)))
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
        let mut events = parse_chunk(&text)?;
        events.push(StreamEvent::Done);
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

/// Decode one SSE line of a streaming completion.
pub fn parse_sse_line(line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let Some(data) = sse_data(line) else {
        return Ok(Vec::new());
    };
    if data == "[DONE]" {
        return Ok(vec![StreamEvent::Done]);
    }
    parse_chunk(data)
}

/// Decode a completion object (a streaming chunk or a whole response).
fn parse_chunk(data: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let chunk: CompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("skipping malformed completion chunk: {e}");
            return Ok(Vec::new());
        }
    };
    if let Some(err) = chunk.error {
        return Err(ProviderError::Unavailable(format!("openai: {}", err.message)));
    }

    let mut events = Vec::new();
    for choice in chunk.choices {
        let content = choice
            .delta
            .or(choice.message)
            .and_then(|c| c.content)
            .unwrap_or_default();
        if !content.is_empty() {
            events.push(StreamEvent::TextDelta(content));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }));
    }
    Ok(events)
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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

    /// Credential presence only; no network round trip.
    fn probe(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move { self.check_key() })
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
