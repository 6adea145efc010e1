//! Token budget for the conversation context.
//!
//! Token counts are estimated from character counts; no tokenizer is
//! involved. The same estimate is used for usage records when a backend does
//! not report token counts.

/// Characters per token used for all estimates.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Estimate tokens for `chars` characters at the default ratio.
pub fn estimate_tokens(chars: usize) -> usize {
    (chars as f64 / DEFAULT_CHARS_PER_TOKEN) as usize
}

/// The context budget and its compression threshold.
///
/// ```ignore
/// let budget = ContextBudget::new(4096, 0.75);
/// assert_eq!(budget.threshold_tokens(), 3072.0);
/// println!("{}", budget.usage(2900).to_log_string());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    max_tokens: usize,
    compression_threshold: f64,
    chars_per_token: f64,
}

impl ContextBudget {
    pub fn new(max_tokens: usize, compression_threshold: f64) -> Self {
        Self {
            max_tokens,
            compression_threshold,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Override the characters-per-token ratio.
    pub fn with_chars_per_token(mut self, cpt: f64) -> Self {
        if cpt > 0.0 {
            self.chars_per_token = cpt;
        }
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn compression_threshold(&self) -> f64 {
        self.compression_threshold
    }

    /// `compression_threshold × max_tokens`.
    pub fn threshold_tokens(&self) -> f64 {
        self.compression_threshold * self.max_tokens as f64
    }

    /// Tokens for `chars` characters at this budget's ratio.
    pub fn tokens_for_chars(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token) as usize
    }

    pub fn exceeds_threshold(&self, token_estimate: usize) -> bool {
        token_estimate as f64 > self.threshold_tokens()
    }

    pub fn usage(&self, token_estimate: usize) -> ContextUsage {
        let usage_pct = if self.max_tokens > 0 {
            token_estimate as f64 / self.max_tokens as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens: token_estimate,
            max_tokens: self.max_tokens,
            usage_pct,
        }
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Maximum context window.
    pub max_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.max_tokens,
        )
    }
}
