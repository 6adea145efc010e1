//! Convenience re-exports for common `termsage` types.
//!
//! ```ignore
//! use termsage::prelude::*;
//! ```
//!
//! Covers building an orchestrator from config, running turns, observing
//! them, and reading findings and usage. Adapter internals (stream decoding,
//! status classification) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatMessage, ConfigError, Error, Role};

// ── Orchestration ───────────────────────────────────────────────────
pub use crate::agent::{
    CancelFlag, CompositeEventHandler, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, ProviderOrchestrator, SessionSnapshot, TurnEvent, TurnOutcome,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::api::{
    CostTracker, ModelSpec, ProviderAdapter, ProviderError, ProviderKind, UsageRecord,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{PerformanceTier, ProviderConfig, TermSageConfig};

// ── Context ─────────────────────────────────────────────────────────
pub use crate::context::{ContextSnapshot, ContextStats, Finding, FindingKind};
