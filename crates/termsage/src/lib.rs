//! Provider orchestration and CTF-aware conversation context for TermSage.
//!
//! TermSage is a terminal assistant that switches between running shell
//! commands and chatting with a language model. This crate is its core: it
//! picks one of several interchangeable model backends (local Ollama,
//! OpenAI-compatible endpoints, Anthropic), falls back when a backend fails,
//! streams responses, tracks token spend, and keeps the conversation inside a
//! token budget by folding low-importance messages into a running summary
//! while pinning messages that carry flags or credentials.
//!
//! # Getting started
//!
//! ```ignore
//! use termsage::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), termsage::Error> {
//!     let config = TermSageConfig::from_toml_str(r#"
//!         provider_priority = ["ollama", "openai"]
//!
//!         [providers.ollama]
//!         kind = "ollama"
//!
//!         [providers.openai]
//!         kind = "openai"
//!         api_key_env = "OPENAI_API_KEY"
//!     "#)?;
//!
//!     let mut orchestrator = ProviderOrchestrator::from_config(config)?;
//!     let outcome = orchestrator
//!         .submit("nmap shows 10.10.11.42:8080 open, what next?", true, &LoggingHandler)
//!         .await?;
//!
//!     println!("{}", outcome.text);
//!     println!("{}", orchestrator.usage_totals().summary());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Backends:** the [`ProviderAdapter`](api::provider::ProviderAdapter)
//!   trait and its three implementations in [`api::ollama`], [`api::openai`]
//!   and [`api::anthropic`]. [`api::build_adapter`] turns a
//!   [`ProviderConfig`](config::ProviderConfig) into an adapter.
//! - **Turns, fallback, streaming, cost:**
//!   [`ProviderOrchestrator`](agent::orchestrator::ProviderOrchestrator).
//!   Observe a turn with an [`EventHandler`](agent::events::EventHandler).
//! - **Context budget and compression:**
//!   [`ContextStore`](context::store::ContextStore), scored by
//!   [`context::scoring`] and folded by a
//!   [`Summarizer`](context::summarizer::Summarizer).
//! - **Findings:** [`FindingExtractor`](context::findings::FindingExtractor).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Orchestrator, provider registry, turn events, prompts |
//! | [`api`] | Adapter trait, HTTP adapters, stream decoding, backoff, pricing |
//! | [`context`] | Context store, importance scoring, findings, summaries, budget |
//! | [`config`] | Configuration structs, TOML parsing, performance tiers |
//! | [`error`] | Error types that cross the crate boundary |

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;

use serde::{Deserialize, Serialize};

pub use error::{ConfigError, Error};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A role-tagged text message in the shape every backend accepts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
