//! The turn loop: provider selection, fallback, streaming and accounting.
//!
//! [`ProviderOrchestrator`] owns the provider registry, the conversation
//! [`ContextStore`] and the usage history. One call to
//! [`submit`](ProviderOrchestrator::submit) is one turn:
//!
//! 1. Probe stale providers concurrently, then walk them in selection order.
//! 2. Skip disabled, rate-limited and unavailable providers.
//! 3. Stream from the first candidate, forwarding every delta to the
//!    [`EventHandler`]. A provider-local failure discards the partial text
//!    and moves on to the next candidate with the original prompt, until
//!    `retry_count` attempts have been made.
//! 4. On success, append the user message and the reply to the store (which
//!    may compress), then record usage.
//!
//! Nothing is mutated before step 4, so a cancelled or exhausted turn leaves
//! the conversation exactly as it was. Dropping the `submit` future is a
//! cancellation too.
//!
//! ```ignore
//! let mut orchestrator = ProviderOrchestrator::from_config(config)?;
//! let printer = FnEventHandler::new(|event| {
//!     if let TurnEvent::TextDelta(text) = event {
//!         print!("{text}");
//!     }
//!     None
//! });
//! let outcome = orchestrator.submit("what does `sudo -l` tell me?", true, &printer).await?;
//! ```

use crate::agent::events::{EventHandler, EventResponse, LoggingHandler, TurnEvent};
use crate::agent::prompt::{
    DEFAULT_SYSTEM_PROMPT, command_help_prompt, conversation_system_prompt, failure_prompt,
};
use crate::agent::registry::{ProviderRegistry, SkipReason};
use crate::api::build_adapter;
use crate::api::provider::{
    PromptRequest, ProviderAdapter, ProviderError, StreamEvent, TokenUsage,
};
use crate::api::router::ModelSpec;
use crate::api::usage::{CostTracker, ModelPricing, UsageRecord, generate_turn_id};
use crate::config::TermSageConfig;
use crate::context::budget::estimate_tokens;
use crate::context::findings::{Finding, FindingKind};
use crate::context::store::{
    CompressionReport, ContextOverflow, ContextSnapshot, ContextStats, ContextStore,
};
use crate::error::{ConfigError, Error, ProviderFailure};
use crate::{ChatMessage, Role};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a committed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: String,
    /// The full reply, exactly as committed to the context.
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: UsageRecord,
    /// Providers that failed or were unavailable before the one that
    /// answered.
    pub failures: Vec<ProviderFailure>,
    /// Findings first seen in this turn.
    pub new_findings: Vec<Finding>,
    /// Compression passes triggered by the two insertions.
    pub compression: Vec<CompressionReport>,
    /// Set when the context is still over its threshold.
    pub overflow: Option<ContextOverflow>,
}

/// Everything needed to resume a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub context: ContextSnapshot,
    #[serde(default)]
    pub usage: Vec<UsageRecord>,
    #[serde(default)]
    pub active_model: Option<ModelSpec>,
}

/// A reply streamed to completion, not yet committed anywhere.
struct Reply {
    text: String,
    provider: String,
    model: String,
    usage: UsageRecord,
    failures: Vec<ProviderFailure>,
}

enum Attempt {
    Complete { text: String, usage: TokenUsage },
    Cancelled,
}

pub struct ProviderOrchestrator {
    config: TermSageConfig,
    registry: ProviderRegistry,
    store: ContextStore,
    usage: Vec<UsageRecord>,
    totals: CostTracker,
    active_model: Option<ModelSpec>,
}

impl ProviderOrchestrator {
    /// Validate `config` and build one adapter per name in
    /// `provider_priority`.
    pub fn from_config(config: TermSageConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut adapters = Vec::with_capacity(config.provider_priority.len());
        for name in &config.provider_priority {
            let provider = config.provider(name).ok_or_else(|| {
                ConfigError::Validation(format!("unknown provider '{name}'"))
            })?;
            adapters.push(build_adapter(name, &provider)?);
        }
        Self::with_adapters(config, adapters)
    }

    /// Use pre-built adapters. Adapters named in `provider_priority` take
    /// that rank; the rest follow in the given order.
    pub fn with_adapters(
        config: TermSageConfig,
        adapters: Vec<Box<dyn ProviderAdapter>>,
    ) -> Result<Self, Error> {
        config.validate_settings()?;
        let fallback_rank = config.provider_priority.len();
        let ranked = adapters
            .into_iter()
            .enumerate()
            .map(|(i, adapter)| {
                let rank = config
                    .provider_priority
                    .iter()
                    .position(|n| n == adapter.name())
                    .unwrap_or(fallback_rank + i);
                (rank, adapter)
            })
            .collect();
        let registry = ProviderRegistry::new(
            ranked,
            config.availability_ttl(),
            config.probe_timeout(),
        );
        let active_model = config
            .model
            .as_deref()
            .and_then(|spec| ModelSpec::parse(spec, registry.names()));
        let store = ContextStore::new(config.store_config());

        info!(
            "Orchestrator ready: providers=[{}], max_tokens={}, retry_count={}",
            registry.names().collect::<Vec<_>>().join(", "),
            config.max_tokens,
            config.retry_count,
        );
        Ok(Self {
            config,
            registry,
            store,
            usage: Vec::new(),
            totals: CostTracker::new(),
            active_model,
        })
    }

    pub fn config(&self) -> &TermSageConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ContextStore {
        &self.store
    }

    fn system_prompt(&self) -> String {
        let base = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        conversation_system_prompt(base, self.store.findings())
    }

    // ── Turns ──

    /// Run one conversational turn.
    pub async fn submit(
        &mut self,
        user_text: &str,
        stream: bool,
        handler: &dyn EventHandler,
    ) -> Result<TurnOutcome, Error> {
        let turn_id = generate_turn_id();
        let context_usage = self.store.budget().usage(self.store.token_estimate());
        handler.on_event(&TurnEvent::TurnStart {
            turn_id: &turn_id,
            context_usage: &context_usage,
        });

        let mut messages = self.store.prompt_messages(Some(&self.system_prompt()));
        messages.push(ChatMessage::user(user_text));

        let reply = self.complete(messages, stream, handler).await?;

        // Commit. Everything above left the store untouched.
        let user_outcome = self.store.push(Role::User, user_text);
        let reply_outcome = self.store.push(Role::Assistant, reply.text.clone());

        let mut new_findings = user_outcome.new_findings;
        new_findings.extend(reply_outcome.new_findings);
        let compression: Vec<CompressionReport> = user_outcome
            .compression
            .into_iter()
            .chain(reply_outcome.compression)
            .collect();
        let overflow = reply_outcome.overflow;

        self.record_usage(reply.usage.clone(), handler);
        if !new_findings.is_empty() {
            handler.on_event(&TurnEvent::NewFindings(&new_findings));
        }
        for report in &compression {
            handler.on_event(&TurnEvent::Compressed(report));
        }
        if let Some(overflow) = &overflow {
            handler.on_event(&TurnEvent::Overflow(overflow));
        }
        handler.on_event(&TurnEvent::TurnFinished {
            provider: &reply.provider,
            chars: reply.text.chars().count(),
        });

        Ok(TurnOutcome {
            turn_id,
            text: reply.text,
            provider: reply.provider,
            model: reply.model,
            usage: reply.usage,
            failures: reply.failures,
            new_findings,
            compression,
            overflow,
        })
    }

    /// Non-streaming turn that returns only the reply text.
    pub async fn submit_text(&mut self, user_text: &str) -> Result<String, Error> {
        let outcome = self.submit(user_text, false, &LoggingHandler).await?;
        Ok(outcome.text)
    }

    /// Ask why a shell command failed. The prompt is standalone and the
    /// conversation is not touched.
    pub async fn explain_failure(
        &mut self,
        command: &str,
        exit_code: i32,
        stderr_excerpt: &str,
    ) -> Result<String, Error> {
        self.one_shot(failure_prompt(command, exit_code, stderr_excerpt))
            .await
    }

    /// Ask what a command does and how it is used. Like
    /// [`explain_failure`](Self::explain_failure), this is standalone.
    pub async fn explain_command(&mut self, command: &str) -> Result<String, Error> {
        self.one_shot(command_help_prompt(command)).await
    }

    async fn one_shot(&mut self, messages: Vec<ChatMessage>) -> Result<String, Error> {
        let reply = self.complete(messages, false, &LoggingHandler).await?;
        self.record_usage(reply.usage, &LoggingHandler);
        Ok(reply.text)
    }

    fn record_usage(&mut self, record: UsageRecord, handler: &dyn EventHandler) {
        handler.on_event(&TurnEvent::TokenUsage {
            prompt_tokens: record.tokens_in,
            completion_tokens: record.tokens_out,
            estimated: record.estimated,
        });
        self.totals.record(&record);
        self.usage.push(record);
    }

    /// Try providers in order until one streams a complete reply.
    async fn complete(
        &mut self,
        messages: Vec<ChatMessage>,
        stream: bool,
        handler: &dyn EventHandler,
    ) -> Result<Reply, Error> {
        self.registry.begin_turn();
        self.registry.refresh_availability(false).await;

        let preferred = self
            .active_model
            .as_ref()
            .and_then(|spec| spec.provider.clone());
        let order = self.registry.ordered(preferred.as_deref());

        let mut failures: Vec<ProviderFailure> = Vec::new();
        let mut attempts: u32 = 0;

        for index in order {
            let slot = self.registry.slot(index);
            let name = slot.name().to_string();

            if let Some(reason) = slot.skip_reason(Instant::now()) {
                let reason_text = reason.to_string();
                handler.on_event(&TurnEvent::ProviderSkipped {
                    provider: &name,
                    reason: &reason_text,
                });
                if reason == SkipReason::Unavailable {
                    failures.push(ProviderFailure {
                        provider: name,
                        error: ProviderError::Unavailable(reason_text),
                    });
                }
                continue;
            }
            if attempts >= self.config.retry_count {
                debug!("Retry budget of {} spent", self.config.retry_count);
                break;
            }
            attempts += 1;

            let adapter = slot.adapter();
            let model = self.model_for(adapter, attempts);
            handler.on_event(&TurnEvent::ProviderSelected {
                provider: &name,
                model: &model,
                attempt: attempts,
            });
            let request = PromptRequest::new(model.clone(), messages.clone());
            let prompt_chars = request.char_count();
            let streaming = stream && adapter.capabilities().stream;
            debug!("Sending {prompt_chars} chars to {name} ({model}), stream={streaming}");

            match run_attempt(adapter, &request, streaming, handler).await {
                Ok(Attempt::Complete { text, usage }) => {
                    let pricing = adapter.pricing(&model);
                    let record = usage_record(&name, &model, usage, pricing, prompt_chars, &text);
                    self.registry.record_success(index);
                    info!(
                        "{name} answered ({} chars) after {} failure(s)",
                        text.chars().count(),
                        failures.len()
                    );
                    return Ok(Reply {
                        text,
                        provider: name,
                        model,
                        usage: record,
                        failures,
                    });
                }
                Ok(Attempt::Cancelled) => {
                    handler.on_event(&TurnEvent::Cancelled);
                    info!("Turn cancelled while streaming from {name}");
                    return Err(Error::Cancelled);
                }
                Err((error, partial_chars)) => {
                    warn!("{name} failed: {error}");
                    handler.on_event(&TurnEvent::ProviderFailed {
                        provider: &name,
                        error: &error,
                        partial_chars,
                    });
                    self.registry.record_failure(index, &error);
                    failures.push(ProviderFailure {
                        provider: name,
                        error,
                    });
                }
            }
        }

        warn!("All providers exhausted after {attempts} attempt(s)");
        Err(Error::AllProvidersExhausted { failures })
    }

    /// The pinned model goes to its provider. A bare model applies only to
    /// the first attempt; later fallbacks use their own defaults.
    fn model_for(&self, adapter: &dyn ProviderAdapter, attempt: u32) -> String {
        match &self.active_model {
            Some(spec) if spec.provider.as_deref() == Some(adapter.name()) => spec.model.clone(),
            Some(spec) if spec.provider.is_none() && attempt == 1 => spec.model.clone(),
            _ => adapter.default_model().to_string(),
        }
    }

    // ── Providers and models ──

    /// Models offered by each available provider. Listing failures are
    /// logged and the provider omitted.
    pub async fn list_available_models(&mut self) -> BTreeMap<String, Vec<String>> {
        self.registry.refresh_availability(false).await;
        let now = Instant::now();
        let mut models = BTreeMap::new();
        for slot in self.registry.slots() {
            if slot.skip_reason(now) == Some(SkipReason::Unavailable)
                || slot.health().disabled
                || !slot.adapter().capabilities().list_models
            {
                continue;
            }
            match slot.adapter().list_models().await {
                Ok(list) if !list.is_empty() => {
                    models.insert(slot.name().to_string(), list);
                }
                Ok(_) => {}
                Err(e) => warn!("Listing models of {} failed: {e}", slot.name()),
            }
        }
        models
    }

    /// Probe every provider now.
    pub async fn check_availability(&mut self) -> Vec<(String, bool)> {
        self.registry.check_availability().await
    }

    /// Select the model for later turns (`provider:model` or `model`).
    pub fn set_model(&mut self, spec: &str) -> Result<&ModelSpec, Error> {
        let parsed = ModelSpec::parse(spec, self.registry.names()).ok_or_else(|| {
            ConfigError::Validation(format!("invalid model spec '{spec}'"))
        })?;
        info!("Active model: {parsed}");
        let active = self.active_model.insert(parsed);
        Ok(&*active)
    }

    pub fn active_model(&self) -> Option<&ModelSpec> {
        self.active_model.as_ref()
    }

    /// Whether the model in `spec` is listed by its provider (or by any
    /// provider for a bare spec).
    pub async fn is_model_available(&self, spec: &str) -> bool {
        let Some(parsed) = ModelSpec::parse(spec, self.registry.names()) else {
            return false;
        };
        for slot in self.registry.slots() {
            if parsed.model_for(slot.name()).is_none() {
                continue;
            }
            match slot.adapter().list_models().await {
                Ok(list) if list.iter().any(|m| *m == parsed.model) => return true,
                Ok(_) => {}
                Err(e) => debug!("Listing models of {} failed: {e}", slot.name()),
            }
        }
        false
    }

    // ── Usage ──

    /// Every usage record of the session, oldest first.
    pub fn get_usage_summary(&self) -> &[UsageRecord] {
        &self.usage
    }

    pub fn usage_totals(&self) -> &CostTracker {
        &self.totals
    }

    // ── Context ──

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            context: self.store.snapshot(),
            usage: self.usage.clone(),
            active_model: self.active_model.clone(),
        }
    }

    /// Replace the session state. The context is held to this session's
    /// budget at once; an overflow that compression cannot resolve is
    /// returned.
    pub fn restore(&mut self, snapshot: SessionSnapshot) -> Option<ContextOverflow> {
        let outcome = self.store.restore(snapshot.context);
        self.totals = CostTracker::from_records(&snapshot.usage);
        self.usage = snapshot.usage;
        self.active_model = snapshot.active_model;
        info!(
            "Session restored: {} messages, {} usage records",
            self.store.messages().len(),
            self.usage.len()
        );
        if let Some(report) = &outcome.compression {
            info!(
                "Restored context compressed: {} message(s) folded, ~{} -> ~{} tokens",
                report.folded.len(),
                report.tokens_before,
                report.tokens_after
            );
        }
        outcome.overflow
    }

    pub fn clear_context(&mut self) {
        self.store.clear();
    }

    pub fn context_stats(&self) -> ContextStats {
        self.store.stats()
    }

    pub fn export_findings(&self) -> Vec<(FindingKind, Vec<Finding>)> {
        self.store.export_findings()
    }
}

/// Stream one attempt to completion. Errors carry the number of characters
/// already forwarded to the handler.
async fn run_attempt(
    adapter: &dyn ProviderAdapter,
    request: &PromptRequest,
    stream: bool,
    handler: &dyn EventHandler,
) -> Result<Attempt, (ProviderError, usize)> {
    let idle = adapter.timeout();
    let mut chunks = match tokio::time::timeout(idle, adapter.send(request, stream)).await {
        Ok(Ok(chunks)) => chunks,
        Ok(Err(e)) => return Err((e, 0)),
        Err(_) => {
            return Err((
                ProviderError::Timeout(format!("no response within {}s", idle.as_secs())),
                0,
            ));
        }
    };

    let mut text = String::new();
    let mut usage = TokenUsage::default();
    loop {
        let next = match tokio::time::timeout(idle, chunks.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err((
                    ProviderError::Timeout(format!("stream idle for {}s", idle.as_secs())),
                    text.chars().count(),
                ));
            }
        };
        match next {
            Some(Ok(StreamEvent::TextDelta(delta))) => {
                if delta.is_empty() {
                    continue;
                }
                text.push_str(&delta);
                if handler.on_event(&TurnEvent::TextDelta(&delta)) == Some(EventResponse::Cancel) {
                    return Ok(Attempt::Cancelled);
                }
            }
            Some(Ok(StreamEvent::Usage(reported))) => usage.merge(reported),
            Some(Ok(StreamEvent::Done)) | None => break,
            Some(Err(e)) => return Err((e, text.chars().count())),
        }
    }

    if text.trim().is_empty() {
        return Err((ProviderError::Unavailable("empty response".into()), 0));
    }
    Ok(Attempt::Complete { text, usage })
}

/// Reported token counts where present, otherwise estimated from characters.
fn usage_record(
    provider: &str,
    model: &str,
    usage: TokenUsage,
    pricing: Option<ModelPricing>,
    prompt_chars: usize,
    reply: &str,
) -> UsageRecord {
    let estimated = usage.prompt_tokens.is_none() || usage.completion_tokens.is_none();
    let tokens_in = usage
        .prompt_tokens
        .unwrap_or_else(|| estimate_tokens(prompt_chars) as u32);
    let tokens_out = usage
        .completion_tokens
        .unwrap_or_else(|| estimate_tokens(reply.chars().count()) as u32);
    UsageRecord {
        provider_name: provider.to_string(),
        model: model.to_string(),
        tokens_in,
        tokens_out,
        estimated_cost: pricing.map_or(0.0, |p| p.estimate_cost(tokens_in, tokens_out)),
        estimated,
        timestamp: Utc::now(),
    }
}
