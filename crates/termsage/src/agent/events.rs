//! Turn events and the handlers that observe them.
//!
//! The orchestrator reports everything that happens during a turn through
//! [`TurnEvent`]. Streaming text arrives as [`TurnEvent::TextDelta`] the
//! moment a chunk is decoded. Handlers may answer any event with
//! [`EventResponse::Cancel`] to abandon the turn at that chunk boundary.
//!
//! The terminal front end stacks [`LoggingHandler`] with an
//! [`FnEventHandler`] that prints deltas; [`CancelFlag`] lets another task
//! abort a turn. Combine them with [`CompositeEventHandler`].

use crate::api::provider::ProviderError;
use crate::context::budget::ContextUsage;
use crate::context::findings::Finding;
use crate::context::store::{CompressionReport, ContextOverflow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Events emitted by the orchestrator during a turn.
#[derive(Debug)]
pub enum TurnEvent<'a> {
    /// A turn is starting.
    TurnStart {
        turn_id: &'a str,
        context_usage: &'a ContextUsage,
    },
    /// A provider was skipped without an attempt (disabled, cooling down
    /// after a rate limit, or failed its availability probe).
    ProviderSkipped { provider: &'a str, reason: &'a str },
    /// An attempt is starting.
    ProviderSelected {
        provider: &'a str,
        model: &'a str,
        attempt: u32,
    },
    /// Incremental response text.
    TextDelta(&'a str),
    /// The attempt failed. Any partial text already shown is void; the next
    /// provider starts over with the original prompt.
    ProviderFailed {
        provider: &'a str,
        error: &'a ProviderError,
        partial_chars: usize,
    },
    /// Token usage recorded for the turn.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
        estimated: bool,
    },
    /// Findings not seen before in this conversation.
    NewFindings(&'a [Finding]),
    /// The context was compressed after the turn was committed.
    Compressed(&'a CompressionReport),
    /// The context is still over its threshold after compression.
    Overflow(&'a ContextOverflow),
    /// The turn completed and was committed.
    TurnFinished { provider: &'a str, chars: usize },
    /// The turn was cancelled by a handler.
    Cancelled,
}

/// A handler's answer to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResponse {
    Continue,
    /// Abandon the turn. Only honoured while a response is in flight.
    Cancel,
}

/// Handler for turn events.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &TurnEvent<'_>) -> Option<EventResponse> {
///         match event {
///             TurnEvent::TextDelta(text) => print!("{text}"),
///             TurnEvent::ProviderFailed { provider, .. } => {
///                 eprintln!("\n[{provider} failed, retrying]");
///             }
///             _ => {}
///         }
///         None
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &TurnEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// Ignores everything.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Wraps a closure as a handler.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&TurnEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&TurnEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&TurnEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &TurnEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Cancels the in-flight turn once the shared flag is set.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl EventHandler for CancelFlag {
    fn on_event(&self, _event: &TurnEvent<'_>) -> Option<EventResponse> {
        self.is_cancelled().then_some(EventResponse::Cancel)
    }
}

/// Fans an event out to every registered handler. Any `Cancel` wins, but
/// later handlers are still called.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler`; dispatch follows insertion order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &TurnEvent<'_>) -> Option<EventResponse> {
        let mut response = None;
        for handler in &self.handlers {
            match handler.on_event(event) {
                Some(EventResponse::Cancel) => response = Some(EventResponse::Cancel),
                Some(EventResponse::Continue) if response.is_none() => {
                    response = Some(EventResponse::Continue)
                }
                _ => {}
            }
        }
        response
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &TurnEvent<'_>) -> Option<EventResponse> {
        match event {
            TurnEvent::TurnStart {
                turn_id,
                context_usage,
            } => {
                info!("[{turn_id}] {}", context_usage.to_log_string());
            }
            TurnEvent::ProviderSkipped { provider, reason } => {
                debug!("Skipping {provider}: {reason}");
            }
            TurnEvent::ProviderSelected {
                provider,
                model,
                attempt,
            } => {
                info!("Attempt {attempt}: {provider} ({model})");
            }
            TurnEvent::TextDelta(text) => {
                debug!("delta: {} chars", text.chars().count());
            }
            TurnEvent::ProviderFailed {
                provider,
                error,
                partial_chars,
            } => {
                warn!("{provider} failed after {partial_chars} chars: {error}");
            }
            TurnEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                estimated,
            } => {
                debug!(
                    "Tokens: prompt={prompt_tokens}, completion={completion_tokens}{}",
                    if *estimated { " (estimated)" } else { "" }
                );
            }
            TurnEvent::NewFindings(findings) => {
                for f in findings.iter() {
                    info!("New {} finding: {} ({:.2})", f.kind, f.value, f.confidence);
                }
            }
            TurnEvent::Compressed(report) => {
                info!(
                    "Compressed {} message(s): ~{} -> ~{} tokens",
                    report.folded.len(),
                    report.tokens_before,
                    report.tokens_after
                );
            }
            TurnEvent::Overflow(overflow) => {
                warn!("{overflow}");
            }
            TurnEvent::TurnFinished { provider, chars } => {
                info!("Turn finished via {provider} ({chars} chars)");
            }
            TurnEvent::Cancelled => {
                info!("Turn cancelled");
            }
        }
        None
    }
}
