//! Turn orchestration: provider fallback, streaming and cost accounting.
//!
//! - [`orchestrator::ProviderOrchestrator`] runs turns against the provider
//!   registry and commits them to the context. Start here.
//! - [`registry`] holds the availability cache and health of each provider.
//! - [`events`] has the [`EventHandler`] trait and [`TurnEvent`] enum for
//!   observing a turn, plus [`LoggingHandler`], [`FnEventHandler`],
//!   [`CancelFlag`] and [`CompositeEventHandler`].
//! - [`prompt`] builds the system prompt and the standalone command prompts.

pub mod events;
pub mod orchestrator;
pub mod prompt;
pub mod registry;

pub use events::{
    CancelFlag, CompositeEventHandler, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, TurnEvent,
};
pub use orchestrator::{ProviderOrchestrator, SessionSnapshot, TurnOutcome};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, SystemPromptBuilder};
pub use registry::{ProviderHealth, ProviderRegistry, ProviderSlot, SkipReason};
