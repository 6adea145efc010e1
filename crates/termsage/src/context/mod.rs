//! Conversation context: bounded history, findings and compression.
//!
//! 1. **[`findings`]**: [`FindingExtractor`] pulls flags, credentials,
//!    hashes, IPs and hosts out of message text.
//! 2. **[`scoring`]**: importance from findings, role, technical content
//!    and recency.
//! 3. **[`store`]**: [`ContextStore`] keeps scored messages under the
//!    token budget, folding the least important ones into a running summary
//!    and never touching pinned or recent messages.
//! 4. **[`summarizer`]**: the [`Summarizer`] used for folding.
//! 5. **[`budget`]**: character-based token estimates and the threshold.

pub mod budget;
pub mod findings;
pub mod scoring;
pub mod store;
pub mod summarizer;

pub use budget::{ContextBudget, ContextUsage, DEFAULT_CHARS_PER_TOKEN, estimate_tokens};
pub use findings::{Finding, FindingExtractor, FindingKind};
pub use store::{
    CompressionReport, ContextOverflow, ContextSnapshot, ContextStats, ContextStore,
    InsertOutcome, Message, MessageId, RestoreOutcome, StoreConfig,
};
pub use summarizer::{DigestSummarizer, Summarizer};
