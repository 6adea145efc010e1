//! Local Ollama daemon (`/api/tags`, `/api/chat`).
//!
//! Streaming responses are newline-delimited JSON: one object per delta, the
//! last one carrying `done: true` and the token counts.

use crate::ChatMessage;
use crate::api::provider::{
    BoxFuture, Capabilities, ChunkStream, PromptRequest, ProviderAdapter, ProviderError,
    ProviderKind, StreamEvent, TokenUsage,
};
use crate::api::retry::{classify_transport, ensure_success};
use crate::api::streaming::line_stream;
use crate::api::usage::ModelPricing;
use crate::api::{http_client, normalize_base_url};
use crate::config::ProviderConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:1b";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OllamaAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    pricing: Option<ModelPricing>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize, Debug)]
struct TagEntry {
    name: Option<String>,
    model: Option<String>,
}

impl OllamaAdapter {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, ConfigError> {
        let timeout = config.timeout().unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            name: name.to_string(),
            client: http_client(timeout)?,
            base_url: normalize_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout,
            pricing: config.pricing,
        })
    }

    async fn fetch_tags(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let resp = ensure_success(&self.name, resp).await?;
        let tags: TagsResponse = resp.json().await.map_err(|e| {
            ProviderError::Unavailable(format!("{}: malformed /api/tags response: {e}", self.name))
        })?;
        Ok(tags
            .models
            .into_iter()
            .filter_map(|m| m.model.or(m.name))
            .collect())
    }

    async fn start(&self, request: PromptRequest, stream: bool) -> Result<ChunkStream, ProviderError> {
        let body = ChatBody {
            model: &request.model,
            messages: &request.messages,
            stream,
            options: request
                .max_output_tokens
                .map(|num_predict| ChatOptions { num_predict }),
        };
        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            stream,
            "ollama chat request"
        );

        let mut builder = self
            .client
            .post(format!("{}/api/chat", self.base_url))
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
            return Ok(line_stream(self.name.clone(), resp, parse_line));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;
        let mut events = parse_line(text.trim())?;
        if !events.iter().any(|e| matches!(e, StreamEvent::Done)) {
            events.push(StreamEvent::Done);
        }
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

/// Decode one NDJSON object from `/api/chat`.
pub fn parse_line(line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let chunk: ChatChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("skipping malformed ollama line: {e}");
            return Ok(Vec::new());
        }
    };
    if let Some(err) = chunk.error {
        return Err(ProviderError::Unavailable(format!("ollama: {err}")));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message
        && !message.content.is_empty()
    {
        events.push(StreamEvent::TextDelta(message.content));
    }
    if chunk.done {
        let usage = TokenUsage {
            prompt_tokens: chunk.prompt_eval_count,
            completion_tokens: chunk.eval_count,
        };
        if !usage.is_empty() {
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Done);
    }
    Ok(events)
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
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

    fn pricing(&self, _model: &str) -> Option<ModelPricing> {
        self.pricing
    }

    /// Reachable and at least one model pulled.
    fn probe(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            let models = self.fetch_tags().await?;
            if models.is_empty() {
                return Err(ProviderError::Unavailable(format!(
                    "{}: no models installed",
                    self.name
                )));
            }
            Ok(())
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
        Box::pin(self.fetch_tags())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_line() {
        let events =
            parse_line(r#"{"model":"llama3","message":{"role":"assistant","content":"Hel"},"done":false}"#)
                .unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("Hel".into())]);
    }

    #[test]
    fn final_line_carries_usage() {
        let events = parse_line(
            r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":26,"eval_count":290}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Usage(TokenUsage::new(26, 290)),
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn error_line_is_failure() {
        let err = parse_line(r#"{"error":"model 'nope' not found"}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(m) if m.contains("not found")));
    }

    #[test]
    fn garbage_line_skipped() {
        assert!(parse_line("not json").unwrap().is_empty());
    }

    #[test]
    fn defaults_applied() {
        let adapter = OllamaAdapter::new("ollama", &ProviderConfig::new(ProviderKind::Ollama)).unwrap();
        assert_eq!(adapter.base_url, DEFAULT_BASE_URL);
        assert_eq!(adapter.default_model(), DEFAULT_MODEL);
        assert_eq!(adapter.pricing("anything"), None);
    }
}
