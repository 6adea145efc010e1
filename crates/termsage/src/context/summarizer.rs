//! Folding compressed messages into the running summary.
//!
//! The summary is updated incrementally: each compression step hands over
//! only the messages being folded, in chronological order, plus the summary
//! so far. The default [`DigestSummarizer`] needs no model call; it keeps one
//! terse line per message and always lists findings verbatim. A leading
//! topics line outlives the per-message lines it was gathered from.

use crate::context::scoring;
use crate::context::store::Message;

const TOPICS_PREFIX: &str = "Topics: ";

/// Produces the new running summary from the old one and a folded batch.
///
/// Implementations must be deterministic for compression to be.
pub trait Summarizer: Send + Sync {
    fn fold(&self, existing: Option<&str>, folded: &[Message]) -> String;
}

/// One line per folded message: role, clipped text, findings. Only the
/// newest `max_lines` lines are kept, so the summary stays bounded. Topics
/// of every folded message go to a first `Topics:` line, most recent last,
/// capped at `max_topics`.
#[derive(Debug, Clone)]
pub struct DigestSummarizer {
    /// Characters of message text kept per line.
    pub max_line_chars: usize,
    pub max_lines: usize,
    pub max_topics: usize,
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self {
            max_line_chars: 60,
            max_lines: 16,
            max_topics: 8,
        }
    }
}

impl DigestSummarizer {
    pub fn new(max_line_chars: usize, max_lines: usize) -> Self {
        Self {
            max_line_chars,
            max_lines: max_lines.max(1),
            ..Self::default()
        }
    }

    pub fn with_max_topics(mut self, max_topics: usize) -> Self {
        self.max_topics = max_topics;
        self
    }

    fn line(&self, message: &Message) -> String {
        let flat = message.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut clipped: String = flat.chars().take(self.max_line_chars).collect();
        if flat.chars().count() > self.max_line_chars {
            clipped.push('…');
        }
        let mut line = format!("- [{}] {clipped}", message.role);
        if !message.findings.is_empty() {
            let findings = message
                .findings
                .iter()
                .map(|f| format!("{}={}", f.kind, f.value))
                .collect::<Vec<_>>()
                .join(", ");
            line.push_str(&format!(" (findings: {findings})"));
        }
        line
    }
}

impl Summarizer for DigestSummarizer {
    fn fold(&self, existing: Option<&str>, folded: &[Message]) -> String {
        let mut topics: Vec<String> = Vec::new();
        let mut lines: Vec<String> = Vec::new();
        for line in existing.unwrap_or_default().lines() {
            if let Some(list) = line.strip_prefix(TOPICS_PREFIX) {
                topics.extend(list.split(", ").filter(|t| !t.is_empty()).map(str::to_string));
            } else if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        for topic in folded.iter().flat_map(|m| scoring::topics(&m.text)) {
            topics.retain(|t| *t != topic);
            topics.push(topic);
        }
        let stale = topics.len().saturating_sub(self.max_topics);
        topics.drain(..stale);

        lines.extend(folded.iter().map(|m| self.line(m)));
        let skip = lines.len().saturating_sub(self.max_lines);

        let mut out: Vec<String> = Vec::with_capacity(self.max_lines + 1);
        if !topics.is_empty() {
            out.push(format!("{TOPICS_PREFIX}{}", topics.join(", ")));
        }
        out.extend(lines.drain(skip..));
        out.join("\n")
    }
}
