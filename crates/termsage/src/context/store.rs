//! The conversation context: scored messages, findings and compression.
//!
//! [`ContextStore`] owns every message of a conversation. Each insertion
//! extracts findings, scores the message, refreshes the recency term of the
//! live messages and, when the estimate crosses
//! `compression_threshold × max_tokens`, folds low-importance messages into
//! the running summary.
//!
//! Two kinds of message are never folded: the `min_messages` most recent
//! ones, and any message holding a finding ranked at or above
//! `pinned_kind`. When nothing else is left to fold and the estimate is
//! still over the threshold, the insertion reports a [`ContextOverflow`]
//! instead of failing.
//!
//! ```ignore
//! let mut store = ContextStore::new(StoreConfig::default());
//! store.push(Role::User, "found HTB{w3b_sh3ll} on 10.10.11.42");
//! assert_eq!(store.findings_of(FindingKind::Flag).len(), 1);
//! ```

use crate::context::budget::{ContextBudget, ContextUsage};
use crate::context::findings::{Finding, FindingExtractor, FindingKind};
use crate::context::scoring;
use crate::context::summarizer::{DigestSummarizer, Summarizer};
use crate::{ChatMessage, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Stable identifier of a stored message, unique for the store's lifetime.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// A stored message. Only `importance_score` changes after insertion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub importance_score: f64,
    pub findings: Vec<Finding>,
}

impl Message {
    /// Most important finding kind in this message.
    pub fn strongest_kind(&self) -> Option<FindingKind> {
        self.findings.iter().map(|f| f.kind).max_by_key(|k| k.rank())
    }

    pub fn is_pinned(&self, pinned_kind: FindingKind) -> bool {
        self.strongest_kind()
            .is_some_and(|k| k.outranks_or_equals(pinned_kind))
    }

    fn base_score(&self) -> f64 {
        scoring::base_score(self.role, &self.text, self.findings.iter().map(|f| f.kind))
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.text.clone(),
        }
    }
}

/// Store settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub max_tokens: usize,
    pub compression_threshold: f64,
    pub min_messages: usize,
    pub batch_size: usize,
    pub pinned_kind: FindingKind,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            compression_threshold: 0.75,
            min_messages: 4,
            batch_size: 2,
            pinned_kind: FindingKind::Credential,
        }
    }
}

/// Compression ran out of eligible messages while still over the threshold.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOverflow {
    pub token_estimate: usize,
    /// The threshold in tokens.
    pub budget: usize,
}

impl std::fmt::Display for ContextOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "context over budget: ~{} tokens > {} (only pinned or recent messages left)",
            self.token_estimate, self.budget
        )
    }
}

/// What one compression pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    /// Folded messages, in the order they were folded.
    pub folded: Vec<MessageId>,
    pub steps: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Result of [`ContextStore::push`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub id: MessageId,
    /// Findings whose `(kind, value)` the store had not seen before.
    pub new_findings: Vec<Finding>,
    pub compression: Option<CompressionReport>,
    pub overflow: Option<ContextOverflow>,
}

/// Result of [`ContextStore::restore`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RestoreOutcome {
    pub compression: Option<CompressionReport>,
    pub overflow: Option<ContextOverflow>,
}

/// Serializable store state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub messages: Vec<Message>,
    pub compressed_summary: Option<String>,
    pub next_id: u64,
    #[serde(default)]
    pub folded_total: usize,
}

/// Point-in-time numbers for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub messages: usize,
    pub pinned_messages: usize,
    pub folded_total: usize,
    pub has_summary: bool,
    pub findings: Vec<(FindingKind, usize)>,
    pub usage: ContextUsage,
}

impl ContextStats {
    pub fn to_log_string(&self) -> String {
        let findings = self
            .findings
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| format!("{k}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{}, {} messages ({} pinned, {} folded), findings: {}",
            self.usage.to_log_string(),
            self.messages,
            self.pinned_messages,
            self.folded_total,
            if findings.is_empty() { "none" } else { &findings },
        )
    }
}

pub struct ContextStore {
    config: StoreConfig,
    budget: ContextBudget,
    extractor: FindingExtractor,
    summarizer: Box<dyn Summarizer>,
    messages: Vec<Message>,
    summary: Option<String>,
    /// Deduplicated by `(kind, value)`, in first-seen order.
    index: Vec<Finding>,
    next_id: u64,
    folded_total: usize,
}

impl ContextStore {
    pub fn new(config: StoreConfig) -> Self {
        let budget = ContextBudget::new(config.max_tokens, config.compression_threshold);
        Self {
            config,
            budget,
            extractor: FindingExtractor::new(),
            summarizer: Box::new(DigestSummarizer::default()),
            messages: Vec::new(),
            summary: None,
            index: Vec::new(),
            next_id: 0,
            folded_total: 0,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_extractor(mut self, extractor: FindingExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Append a message, then compress if over the threshold.
    pub fn push(&mut self, role: Role, text: impl Into<String>) -> InsertOutcome {
        let text = text.into();
        let id = MessageId(self.next_id);
        self.next_id += 1;

        let mut findings: Vec<Finding> = Vec::new();
        for m in self.extractor.extract(&text) {
            merge_finding(&mut findings, m.into_finding(id));
        }
        let new_findings: Vec<Finding> = findings
            .iter()
            .filter(|f| !self.index.iter().any(|i| i.kind == f.kind && i.value == f.value))
            .cloned()
            .collect();

        let mut message = Message {
            id,
            role,
            text,
            created_at: Utc::now(),
            importance_score: 0.0,
            findings,
        };
        message.importance_score = scoring::importance(message.base_score(), 0);
        debug!(
            id = %id,
            role = %role,
            score = message.importance_score,
            findings = message.findings.len(),
            "context insert"
        );
        for finding in &message.findings {
            merge_finding(&mut self.index, finding.clone());
        }
        self.messages.push(message);
        self.refresh_recency();

        let (compression, overflow) = self.compress();
        InsertOutcome {
            id,
            new_findings,
            compression,
            overflow,
        }
    }

    /// Recompute the recency term of every live message.
    fn refresh_recency(&mut self) {
        let newest = self.messages.len().saturating_sub(1);
        for (i, message) in self.messages.iter_mut().enumerate() {
            message.importance_score = scoring::importance(message.base_score(), newest - i);
        }
    }

    fn compress(&mut self) -> (Option<CompressionReport>, Option<ContextOverflow>) {
        let tokens_before = self.token_estimate();
        if !self.budget.exceeds_threshold(tokens_before) {
            return (None, None);
        }

        let mut folded_ids = Vec::new();
        let mut steps = 0;
        let mut overflow = None;

        while self.budget.exceeds_threshold(self.token_estimate()) {
            let protected_from = self.messages.len().saturating_sub(self.config.min_messages);
            let mut eligible: Vec<usize> = (0..protected_from)
                .filter(|&i| !self.messages[i].is_pinned(self.config.pinned_kind))
                .collect();
            if eligible.is_empty() {
                let o = ContextOverflow {
                    token_estimate: self.token_estimate(),
                    budget: self.budget.threshold_tokens() as usize,
                };
                warn!("{o}");
                overflow = Some(o);
                break;
            }

            // Lowest importance first; ties go to the older message.
            eligible.sort_by(|&a, &b| {
                self.messages[a]
                    .importance_score
                    .total_cmp(&self.messages[b].importance_score)
                    .then(a.cmp(&b))
            });
            eligible.truncate(self.config.batch_size.max(1));
            eligible.sort_unstable();

            let mut batch = Vec::with_capacity(eligible.len());
            for &i in eligible.iter().rev() {
                batch.push(self.messages.remove(i));
            }
            batch.reverse();

            self.summary = Some(self.summarizer.fold(self.summary.as_deref(), &batch));
            folded_ids.extend(batch.iter().map(|m| m.id));
            self.folded_total += batch.len();
            self.rebuild_index();
            steps += 1;
        }

        let report = (!folded_ids.is_empty()).then(|| {
            let report = CompressionReport {
                folded: folded_ids,
                steps,
                tokens_before,
                tokens_after: self.token_estimate(),
            };
            info!(
                folded = report.folded.len(),
                steps = report.steps,
                "context compressed: ~{} -> ~{} tokens",
                report.tokens_before,
                report.tokens_after,
            );
            report
        });
        (report, overflow)
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for message in &self.messages {
            for finding in &message.findings {
                merge_finding(&mut self.index, finding.clone());
            }
        }
    }

    // ── Reads ──

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn compressed_summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Characters of live messages plus the summary, at 4 chars per token.
    pub fn token_estimate(&self) -> usize {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| m.text.chars().count())
            .sum::<usize>()
            + self.summary.as_deref().map_or(0, |s| s.chars().count());
        self.budget.tokens_for_chars(chars)
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Deduplicated findings from live messages.
    pub fn findings(&self) -> &[Finding] {
        &self.index
    }

    pub fn findings_of(&self, kind: FindingKind) -> Vec<&Finding> {
        self.index.iter().filter(|f| f.kind == kind).collect()
    }

    /// Findings grouped by kind, most important kind first.
    pub fn export_findings(&self) -> Vec<(FindingKind, Vec<Finding>)> {
        FindingKind::ALL
            .iter()
            .map(|&kind| {
                let of_kind: Vec<Finding> =
                    self.index.iter().filter(|f| f.kind == kind).cloned().collect();
                (kind, of_kind)
            })
            .filter(|(_, v)| !v.is_empty())
            .collect()
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            messages: self.messages.len(),
            pinned_messages: self
                .messages
                .iter()
                .filter(|m| m.is_pinned(self.config.pinned_kind))
                .count(),
            folded_total: self.folded_total,
            has_summary: self.summary.is_some(),
            findings: FindingKind::ALL
                .iter()
                .map(|&k| (k, self.index.iter().filter(|f| f.kind == k).count()))
                .collect(),
            usage: self.budget.usage(self.token_estimate()),
        }
    }

    /// The message list sent to a backend: system prompt, the summary as a
    /// system message, then live messages.
    pub fn prompt_messages(&self, system_prompt: Option<&str>) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        if let Some(prompt) = system_prompt {
            out.push(ChatMessage::system(prompt));
        }
        if let Some(summary) = &self.summary {
            out.push(ChatMessage::system(format!(
                "Summary of earlier conversation:\n{summary}"
            )));
        }
        out.extend(self.messages.iter().map(Message::to_chat));
        out
    }

    // ── Whole-state operations ──

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            messages: self.messages.clone(),
            compressed_summary: self.summary.clone(),
            next_id: self.next_id,
            folded_total: self.folded_total,
        }
    }

    /// Replace the whole state. Scores are taken as stored.
    ///
    /// The restored state is held to this store's budget, which may be
    /// smaller than the one it was saved under: compression runs at once and
    /// any remaining overflow is reported here rather than on the next push.
    /// A snapshot restored under its own budget comes back unchanged.
    pub fn restore(&mut self, snapshot: ContextSnapshot) -> RestoreOutcome {
        let max_id = snapshot.messages.iter().map(|m| m.id.0 + 1).max().unwrap_or(0);
        self.messages = snapshot.messages;
        self.summary = snapshot.compressed_summary;
        self.next_id = snapshot.next_id.max(max_id);
        self.folded_total = snapshot.folded_total;
        self.rebuild_index();

        let (compression, overflow) = self.compress();
        RestoreOutcome {
            compression,
            overflow,
        }
    }

    /// Drop all messages, the summary and the findings.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.summary = None;
        self.index.clear();
        self.folded_total = 0;
    }
}

/// Insert `finding` unless an entry with the same `(kind, value)` exists.
/// A strictly higher confidence replaces the existing entry in place.
fn merge_finding(index: &mut Vec<Finding>, finding: Finding) {
    match index
        .iter()
        .position(|f| f.kind == finding.kind && f.value == finding.value)
    {
        Some(i) => {
            if finding.confidence > index[i].confidence {
                index[i] = finding;
            }
        }
        None => index.push(finding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_tokens: usize, min_messages: usize) -> ContextStore {
        ContextStore::new(StoreConfig {
            max_tokens,
            compression_threshold: 1.0,
            min_messages,
            batch_size: 2,
            pinned_kind: FindingKind::Credential,
        })
    }

    #[test]
    fn push_extracts_and_scores() {
        let mut store = store(10_000, 4);
        let outcome = store.push(Role::Assistant, "the flag is flag{abc123}");
        assert_eq!(outcome.id, MessageId(0));
        assert_eq!(outcome.new_findings.len(), 1);
        assert!(outcome.compression.is_none());

        let message = &store.messages()[0];
        assert_eq!(message.strongest_kind(), Some(FindingKind::Flag));
        // flag + assistant + full recency
        assert!((message.importance_score - (0.45 + 0.15 + 0.20)).abs() < 1e-9);
    }

    #[test]
    fn duplicate_flags_deduplicated() {
        let mut store = store(10_000, 4);
        store.push(Role::User, "flag{abc123}");
        let second = store.push(Role::Assistant, "confirmed: flag{abc123} flag{abc123}");
        assert!(second.new_findings.is_empty());

        let flags = store.findings_of(FindingKind::Flag);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].value, "abc123");
        assert_eq!(flags[0].source_message_id, MessageId(0));
        assert_eq!(store.messages()[1].findings.len(), 1);
    }

    #[test]
    fn higher_confidence_replaces() {
        let mut index = Vec::new();
        let low = Finding {
            kind: FindingKind::Credential,
            value: "admin:pw".into(),
            source_message_id: MessageId(1),
            confidence: 0.55,
        };
        let high = Finding {
            confidence: 0.85,
            source_message_id: MessageId(2),
            ..low.clone()
        };
        merge_finding(&mut index, low.clone());
        merge_finding(&mut index, high.clone());
        merge_finding(&mut index, low);
        assert_eq!(index, vec![high]);
    }

    #[test]
    fn recency_refreshed_on_insert() {
        let mut store = store(10_000, 4);
        store.push(Role::User, "hello");
        let first = store.messages()[0].importance_score;
        store.push(Role::User, "again");
        let aged = store.messages()[0].importance_score;
        assert!((first - aged - (0.20 - 0.16)).abs() < 1e-9);
    }

    #[test]
    fn compression_folds_oldest_low_scores() {
        // 400 chars per message = 100 tokens; budget 400 tokens.
        let mut store = store(400, 2);
        let filler = |c: char| c.to_string().repeat(400);
        for c in ['a', 'b', 'c'] {
            assert!(store.push(Role::User, filler(c)).compression.is_none());
        }
        let outcome = store.push(Role::User, filler('d'));
        assert!(outcome.compression.is_none());
        let outcome = store.push(Role::User, filler('e'));
        let report = outcome.compression.expect("compressed");
        assert_eq!(report.folded, vec![MessageId(0), MessageId(1)]);
        assert!(report.tokens_after <= 400);
        assert!(outcome.overflow.is_none());
        assert_eq!(store.messages().len(), 3);
        assert!(store.compressed_summary().unwrap().contains("[user] aaaa"));
        assert!(store.token_estimate() <= 400);
    }

    #[test]
    fn pinned_and_recent_survive_with_overflow() {
        let mut store = store(50, 2);
        store.push(Role::User, format!("creds user: admin pass: hunter2 {}", "x".repeat(150)));
        store.push(Role::User, "y".repeat(100));
        let outcome = store.push(Role::User, "z".repeat(100));

        // Only the pinned credential message was old enough, so nothing folds.
        let overflow = outcome.overflow.expect("overflow");
        assert_eq!(overflow.budget, 50);
        assert!(overflow.token_estimate > 50);
        assert_eq!(store.messages().len(), 3);
        assert_eq!(store.findings_of(FindingKind::Credential).len(), 1);
        assert!(store.compressed_summary().is_none());
    }

    #[test]
    fn folding_drops_findings_of_folded_messages() {
        let mut store = store(120, 1);
        store.push(Role::User, format!("host 10.10.10.10 {}", "a".repeat(200)));
        store.push(Role::User, "b".repeat(200));
        let outcome = store.push(Role::User, "c".repeat(200));
        assert_eq!(
            outcome.compression.map(|r| r.folded),
            Some(vec![MessageId(0), MessageId(1)])
        );
        assert!(outcome.overflow.is_none());
        assert!(store.findings_of(FindingKind::Ip).is_empty());
        assert!(store.compressed_summary().unwrap().contains("ip=10.10.10.10"));
    }

    #[test]
    fn snapshot_restore_identity() {
        let mut store = store(100, 2);
        for i in 0..6 {
            store.push(Role::User, format!("step {i} on 10.0.0.{i} {}", "z".repeat(60)));
        }
        let snap = store.snapshot();

        let mut other = ContextStore::new(store.config().clone());
        assert_eq!(other.restore(snap.clone()), RestoreOutcome::default());
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.findings(), store.findings());
        assert_eq!(other.token_estimate(), store.token_estimate());

        let next = other.push(Role::User, "next");
        assert_eq!(next.id, MessageId(snap.next_id));
    }

    #[test]
    fn restore_into_smaller_budget_compresses_and_reports() {
        let mut store = store(100, 2);
        for i in 0..6 {
            store.push(Role::User, format!("step {i} on 10.0.0.{i} {}", "z".repeat(60)));
        }
        let snap = store.snapshot();

        let mut small = ContextStore::new(StoreConfig {
            max_tokens: 30,
            ..store.config().clone()
        });
        let outcome = small.restore(snap.clone());
        let overflow = outcome.overflow.expect("two recent messages exceed 30 tokens");
        assert_eq!(overflow.token_estimate, small.token_estimate());
        assert_eq!(small.messages().len(), 2);
        assert_eq!(
            small.messages().last().map(|m| m.id),
            snap.messages.last().map(|m| m.id)
        );
    }

    #[test]
    fn prompt_messages_layout() {
        let mut store = store(10_000, 2);
        store.push(Role::User, "q");
        store.push(Role::Assistant, "a");
        store.summary = Some("- [user] earlier".into());

        let prompt = store.prompt_messages(Some("sys"));
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0], ChatMessage::system("sys"));
        assert!(prompt[1].content.contains("earlier"));
        assert_eq!(prompt[3], ChatMessage::assistant("a"));
        assert_eq!(store.prompt_messages(None).len(), 3);
    }

    #[test]
    fn stats_and_clear() {
        let mut store = store(10_000, 2);
        store.push(Role::User, "flag{x} at 10.10.10.1");
        let stats = store.stats();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.pinned_messages, 1);
        assert!(stats.to_log_string().contains("flag=1"));
        assert_eq!(store.export_findings().len(), 2);

        store.clear();
        assert!(store.messages().is_empty());
        assert!(store.findings().is_empty());
        assert_eq!(store.token_estimate(), 0);
    }
}
