//! Errors that cross the crate boundary.
//!
//! Provider-local failures ([`ProviderError`]) are recovered by fallback inside
//! a turn and only ever surface as the per-provider reasons carried by
//! [`Error::AllProvidersExhausted`]. Context overflow is a warning attached to
//! a successful turn, not an error.

use crate::api::provider::ProviderError;

/// A provider that failed during a turn, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Turn-fatal and construction errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("all providers exhausted: {}", format_failures(.failures))]
    AllProvidersExhausted { failures: Vec<ProviderFailure> },

    #[error("turn cancelled")]
    Cancelled,

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Errors raised while parsing or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no provider was attempted".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
