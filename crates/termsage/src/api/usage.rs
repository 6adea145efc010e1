//! Turn identifiers, per-model pricing and usage accounting.
//!
//! Every successful turn appends one [`UsageRecord`]. The [`CostTracker`]
//! keeps running totals for a session-level summary line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Turn id: millisecond timestamp plus a process-wide sequence number, so
/// two turns started in the same millisecond still differ.
pub fn generate_turn_id() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("turn-{}-{seq}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
}

/// USD per million tokens, split by direction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

impl ModelPricing {
    /// Local backends.
    pub const FREE: ModelPricing = ModelPricing::new(0.0, 0.0);

    pub const fn new(input_usd_per_mtok: f64, output_usd_per_mtok: f64) -> Self {
        Self {
            input_usd_per_mtok,
            output_usd_per_mtok,
        }
    }

    pub fn estimate_cost(&self, tokens_in: u32, tokens_out: u32) -> f64 {
        (f64::from(tokens_in) * self.input_usd_per_mtok
            + f64::from(tokens_out) * self.output_usd_per_mtok)
            / 1_000_000.0
    }
}

impl Default for ModelPricing {
    /// Unknown remote model: priced like a mid-tier model so spend is not
    /// under-reported.
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Name fragments checked in order; the first match wins, so more specific
/// fragments come before the families that contain them.
const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing::new(15.0, 75.0)),
    ("sonnet", ModelPricing::new(3.0, 15.0)),
    ("haiku", ModelPricing::new(0.80, 4.0)),
    ("4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60)),
    ("gpt-3.5", ModelPricing::new(0.50, 1.50)),
    ("gpt-4", ModelPricing::new(2.50, 10.0)),
    ("o3-mini", ModelPricing::new(1.10, 4.40)),
    ("o1", ModelPricing::new(15.0, 60.0)),
    ("deepseek", ModelPricing::new(0.27, 1.10)),
    ("mistral", ModelPricing::new(0.25, 0.25)),
];

/// List-price guess for a remote model. Only the part after the last `/`
/// is matched, so an org prefix cannot select the wrong family.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let base = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
    PRICE_TABLE
        .iter()
        .find(|(fragment, _)| base.contains(fragment))
        .map(|(_, pricing)| *pricing)
        .unwrap_or_default()
}

/// One successful turn's token spend. Append-only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub provider_name: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    /// True when the token counts were estimated from character counts
    /// because the backend did not report usage.
    pub estimated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Running totals over a session's usage records.
#[derive(Debug, Default, Clone)]
pub struct CostTracker {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub turns: u32,
    /// Turns whose counts were estimated rather than reported.
    pub estimated_turns: u32,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: &UsageRecord) {
        self.tokens_in += u64::from(usage.tokens_in);
        self.tokens_out += u64::from(usage.tokens_out);
        self.cost_usd += usage.estimated_cost;
        self.turns += 1;
        if usage.estimated {
            self.estimated_turns += 1;
        }
    }

    /// Rebuild totals from a record history (after a restore).
    pub fn from_records(records: &[UsageRecord]) -> Self {
        records.iter().fold(Self::new(), |mut tracker, record| {
            tracker.record(record);
            tracker
        })
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    /// One line for the end of a session or `/usage`.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} turns, {} tokens in / {} out, ~${:.4}",
            self.turns, self.tokens_in, self.tokens_out, self.cost_usd,
        );
        if self.estimated_turns > 0 {
            line.push_str(&format!(" ({} estimated)", self.estimated_turns));
        }
        line
    }
}
