//! Model selection: which provider and model a turn should prefer.
//!
//! A model spec is either `provider:model` (pin a provider) or a bare
//! `model` (use it on whichever provider answers first). Ollama tags contain
//! colons themselves (`llama3:8b`), so only a prefix that names a configured
//! provider is treated as one.

use serde::{Deserialize, Serialize};

/// A parsed model selection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Provider to try first, if pinned.
    pub provider: Option<String>,
    pub model: String,
}

impl ModelSpec {
    /// Parse `spec` against the set of configured provider names.
    ///
    /// Returns `None` for an empty spec or an empty model part.
    pub fn parse<'a>(spec: &str, providers: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        if let Some((prefix, model)) = spec.split_once(':')
            && providers.into_iter().any(|p| p == prefix)
        {
            let model = model.trim();
            if model.is_empty() {
                return None;
            }
            return Some(Self {
                provider: Some(prefix.to_string()),
                model: model.to_string(),
            });
        }
        Some(Self {
            provider: None,
            model: spec.to_string(),
        })
    }

    /// Model to use on `provider`, or `None` if this spec pins another one.
    pub fn model_for(&self, provider: &str) -> Option<&str> {
        match &self.provider {
            Some(p) if p != provider => None,
            _ => Some(&self.model),
        }
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.provider {
            Some(p) => write!(f, "{p}:{}", self.model),
            None => write!(f, "{}", self.model),
        }
    }
}
