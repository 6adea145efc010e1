//! HTTP adapters against mock servers.

use futures::StreamExt;
use std::time::Duration;
use termsage::api::build_adapter;
use termsage::api::provider::{PromptRequest, ProviderAdapter, StreamEvent, TokenUsage};
use termsage::prelude::*;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str) -> PromptRequest {
    PromptRequest::new(
        model,
        vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("what port is ssh?"),
        ],
    )
}

/// Drain a response into its text, merged usage and whether it ended cleanly.
async fn drain(
    adapter: &dyn ProviderAdapter,
    req: &PromptRequest,
    stream: bool,
) -> Result<(String, TokenUsage, bool), ProviderError> {
    let mut chunks = adapter.send(req, stream).await?;
    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut done = false;
    while let Some(event) = chunks.next().await {
        match event? {
            StreamEvent::TextDelta(delta) => text.push_str(&delta),
            StreamEvent::Usage(u) => usage.merge(u),
            StreamEvent::Done => done = true,
        }
    }
    Ok((text, usage, done))
}

fn ollama(uri: &str) -> Box<dyn ProviderAdapter> {
    build_adapter(
        "ollama",
        &ProviderConfig::new(ProviderKind::Ollama).with_base_url(uri),
    )
    .unwrap()
}

fn openai(uri: &str) -> Box<dyn ProviderAdapter> {
    build_adapter(
        "openai",
        &ProviderConfig::new(ProviderKind::OpenAi)
            .with_base_url(uri)
            .with_api_key("sk-test"),
    )
    .unwrap()
}

fn anthropic(uri: &str) -> Box<dyn ProviderAdapter> {
    build_adapter(
        "anthropic",
        &ProviderConfig::new(ProviderKind::Anthropic)
            .with_base_url(uri)
            .with_api_key("test-key"),
    )
    .unwrap()
}

// ── Ollama ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ollama_streams_ndjson_with_usage() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"model":"llama3.2:1b","message":{"role":"assistant","content":"Port "},"done":false}"#,
        "\n",
        r#"{"model":"llama3.2:1b","message":{"role":"assistant","content":"22."},"done":false}"#,
        "\n",
        r#"{"model":"llama3.2:1b","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":18,"eval_count":4}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({
            "model": "llama3.2:1b",
            "stream": true,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = ollama(&server.uri());
    let (text, usage, done) = drain(adapter.as_ref(), &request("llama3.2:1b"), true)
        .await
        .unwrap();
    assert_eq!(text, "Port 22.");
    assert_eq!(usage, TokenUsage::new(18, 4));
    assert!(done);
}

#[tokio::test]
async fn ollama_probe_requires_installed_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{"name": "llama3.2:1b", "model": "llama3.2:1b"}]
        })))
        .mount(&server)
        .await;

    let adapter = ollama(&server.uri());
    assert!(adapter.probe().await.is_ok());
    assert_eq!(adapter.list_models().await.unwrap(), vec!["llama3.2:1b"]);

    let empty = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
        .mount(&empty)
        .await;
    let adapter = ollama(&empty.uri());
    assert!(matches!(
        adapter.probe().await,
        Err(ProviderError::Unavailable(_))
    ));
}

#[tokio::test]
async fn ollama_unreachable_is_unavailable() {
    let adapter = build_adapter(
        "ollama",
        &ProviderConfig::new(ProviderKind::Ollama)
            .with_base_url("http://127.0.0.1:9")
            .with_timeout_secs(2),
    )
    .unwrap();
    assert!(matches!(
        adapter.probe().await,
        Err(ProviderError::Unavailable(_) | ProviderError::Timeout(_))
    ));
}

#[tokio::test]
async fn ollama_non_stream_single_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {"role": "assistant", "content": "Port 22."},
            "done": true,
            "prompt_eval_count": 18,
            "eval_count": 4
        })))
        .mount(&server)
        .await;

    let adapter = ollama(&server.uri());
    let (text, usage, done) = drain(adapter.as_ref(), &request("llama3.2:1b"), false)
        .await
        .unwrap();
    assert_eq!(text, "Port 22.");
    assert_eq!(usage.completion_tokens, Some(4));
    assert!(done);
}

// ── OpenAI-compatible ──────────────────────────────────────────────

#[tokio::test]
async fn openai_streams_sse_until_done() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Port\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" 22.\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":21,\"completion_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "stream_options": {"include_usage": true},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = openai(&server.uri());
    let (text, usage, done) = drain(adapter.as_ref(), &request("gpt-4o-mini"), true)
        .await
        .unwrap();
    assert_eq!(text, "Port 22.");
    assert_eq!(usage, TokenUsage::new(21, 3));
    assert!(done);
}

#[tokio::test]
async fn openai_status_codes_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "denied"})))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "busy"})))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "broken"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let adapter = openai(&server.uri());
    assert!(matches!(
        drain(adapter.as_ref(), &request("denied"), true).await,
        Err(ProviderError::Auth(_))
    ));
    assert_eq!(
        drain(adapter.as_ref(), &request("busy"), true).await.unwrap_err(),
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
    assert!(matches!(
        drain(adapter.as_ref(), &request("broken"), false).await,
        Err(ProviderError::Unavailable(_))
    ));
}

#[tokio::test]
async fn openai_lists_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"id": "gpt-4o-mini"}, {"id": "gpt-4o"}]
        })))
        .mount(&server)
        .await;

    let adapter = openai(&server.uri());
    assert_eq!(
        adapter.list_models().await.unwrap(),
        vec!["gpt-4o-mini", "gpt-4o"]
    );
}

// ── Anthropic ──────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_streams_typed_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Port\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" 22.\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":6}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(serde_json::json!({
            "system": "You are terse.",
            "stream": true,
            "messages": [{"role": "user", "content": "what port is ssh?"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = anthropic(&server.uri());
    let (text, usage, done) = drain(adapter.as_ref(), &request("claude-3-5-haiku-latest"), true)
        .await
        .unwrap();
    assert_eq!(text, "Port 22.");
    assert_eq!(usage, TokenUsage::new(25, 6));
    assert!(done);
}

#[tokio::test]
async fn anthropic_overload_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .mount(&server)
        .await;
    let adapter = anthropic(&server.uri());
    assert!(matches!(
        drain(adapter.as_ref(), &request("claude"), true).await,
        Err(ProviderError::Unavailable(_))
    ));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let adapter = anthropic(&server.uri());
    assert!(matches!(
        drain(adapter.as_ref(), &request("claude"), false).await,
        Err(ProviderError::Auth(_))
    ));
}

// ── Through the orchestrator ───────────────────────────────────────

#[tokio::test]
async fn orchestrator_falls_back_from_dead_ollama_to_openai() {
    let local = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&local)
        .await;

    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Check HTB{r3m0t3} in /root."}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 9}
        })))
        .mount(&remote)
        .await;

    let config = TermSageConfig::default()
        .with_provider_priority(["local", "remote"])
        .with_provider(
            "local",
            ProviderConfig::new(ProviderKind::Ollama).with_base_url(local.uri()),
        )
        .with_provider(
            "remote",
            ProviderConfig::new(ProviderKind::OpenAi)
                .with_base_url(remote.uri())
                .with_model("gpt-4o-mini"),
        )
        .with_stream(false);
    let mut orchestrator = ProviderOrchestrator::from_config(config).unwrap();

    let outcome = orchestrator
        .submit("where is the root flag?", false, &NoopHandler)
        .await
        .unwrap();
    assert_eq!(outcome.provider, "remote");
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].provider, "local");
    assert_eq!(outcome.usage.tokens_in, 120);
    assert!(!outcome.usage.estimated);
    assert!(outcome.usage.estimated_cost > 0.0);
    assert_eq!(
        orchestrator.context().findings_of(FindingKind::Flag)[0].value,
        "r3m0t3"
    );
}
