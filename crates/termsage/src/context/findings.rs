//! CTF finding extraction: flags, IPs, hashes, credentials, hosts.
//!
//! [`FindingExtractor::extract`] is a pure function of its input. Each kind
//! has one or more matchers with a fixed confidence; within a kind, matches
//! never overlap (higher-confidence matchers claim their spans first).
//! Deduplication across messages is the store's job.

use crate::context::store::MessageId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::ops::Range;
use std::sync::LazyLock;

/// What a finding is. Variants are listed from most to least important.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FindingKind {
    Flag,
    Credential,
    Hash,
    Ip,
    Host,
    Custom,
}

impl FindingKind {
    pub const ALL: [FindingKind; 6] = [
        FindingKind::Flag,
        FindingKind::Credential,
        FindingKind::Hash,
        FindingKind::Ip,
        FindingKind::Host,
        FindingKind::Custom,
    ];

    /// Importance rank; higher is more important.
    pub fn rank(self) -> u8 {
        match self {
            FindingKind::Flag => 5,
            FindingKind::Credential => 4,
            FindingKind::Hash => 3,
            FindingKind::Ip => 2,
            FindingKind::Host => 1,
            FindingKind::Custom => 0,
        }
    }

    pub fn outranks_or_equals(self, other: FindingKind) -> bool {
        self.rank() >= other.rank()
    }
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FindingKind::Flag => "flag",
            FindingKind::Credential => "credential",
            FindingKind::Hash => "hash",
            FindingKind::Ip => "ip",
            FindingKind::Host => "host",
            FindingKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// A finding attached to a stored message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Finding {
    pub kind: FindingKind,
    pub value: String,
    pub source_message_id: MessageId,
    /// In `[0, 1]`.
    pub confidence: f64,
}

/// A raw extractor match, not yet tied to a message.
#[derive(Clone, Debug, PartialEq)]
pub struct FindingMatch {
    pub kind: FindingKind,
    pub value: String,
    pub confidence: f64,
}

impl FindingMatch {
    pub fn into_finding(self, source: MessageId) -> Finding {
        Finding {
            kind: self.kind,
            value: self.value,
            source_message_id: source,
            confidence: self.confidence,
        }
    }
}

// ── Built-in patterns ──

#[allow(clippy::expect_used)]
static FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:flag|ctf|htb|thm|picoctf)\{([^{}\r\n]{1,256})\}").expect("valid regex")
});

#[allow(clippy::expect_used)]
static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})(?::(\d{1,5}))?\b")
        .expect("valid regex")
});

/// Candidates only; validated with `Ipv6Addr`.
#[allow(clippy::expect_used)]
static IPV6_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{0,4}(?::[0-9a-f]{0,4}){2,7}").expect("valid regex")
});

#[allow(clippy::expect_used)]
static HEX_HASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:[0-9a-f]{128}|[0-9a-f]{64}|[0-9a-f]{40}|[0-9a-f]{32})\b")
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static CRYPT_HASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:[156]\$(?:rounds=\d+\$)?[./A-Za-z0-9]{1,16}\$[./A-Za-z0-9]{22,86}|2[aby]\$\d{2}\$[./A-Za-z0-9]{53})",
    )
    .expect("valid regex")
});

#[allow(clippy::expect_used)]
static CRED_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:user(?:name)?|login)\s*[:=]\s*([^\s,;]+)[\s,;]+(?:pass(?:word)?|passwd|pwd)\s*[:=]\s*([^\s,;]+)",
    )
    .expect("valid regex")
});

#[allow(clippy::expect_used)]
static PASSWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:pass(?:word)?|passwd|pwd)\s*[:=]\s*([^\s,;]+)").expect("valid regex")
});

#[allow(clippy::expect_used)]
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^\s'"`()<>\[\],;]+"#).expect("valid regex"));

#[allow(clippy::expect_used)]
static BARE_CRED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9._-]{1,31}):([^\s:/@\\{}]{3,64})$").expect("valid regex")
});

#[allow(clippy::expect_used)]
static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:htb|thm|local|lan|internal|ctf|corp|com|net|org|io|edu|gov)\b",
    )
    .expect("valid regex")
});

const FLAG_CONFIDENCE: f64 = 0.95;
const IPV4_CONFIDENCE: f64 = 0.90;
const IPV6_CONFIDENCE: f64 = 0.85;
const HEX_HASH_CONFIDENCE: f64 = 0.40;
const CRYPT_HASH_CONFIDENCE: f64 = 0.70;
const CRED_PAIR_CONFIDENCE: f64 = 0.85;
const PASSWORD_CONFIDENCE: f64 = 0.75;
const BARE_CRED_CONFIDENCE: f64 = 0.55;
const HOST_CONFIDENCE: f64 = 0.60;

/// A caller-registered matcher. The value is capture group 1 when present,
/// otherwise the whole match.
#[derive(Debug, Clone)]
pub struct CustomMatcher {
    pub regex: Regex,
    pub confidence: f64,
}

/// Extracts findings from message text.
#[derive(Debug, Clone, Default)]
pub struct FindingExtractor {
    custom: Vec<CustomMatcher>,
}

/// Span-tracked candidate used to enforce non-overlap within a kind.
struct Candidate {
    span: Range<usize>,
    value: String,
    confidence: f64,
}

impl FindingExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom matcher. Confidence is clamped to `[0, 1]`.
    pub fn with_custom(mut self, pattern: &str, confidence: f64) -> Result<Self, regex::Error> {
        self.custom.push(CustomMatcher {
            regex: Regex::new(pattern)?,
            confidence: confidence.clamp(0.0, 1.0),
        });
        Ok(self)
    }

    /// All findings in `text`, grouped by kind in rank order, then by
    /// position.
    pub fn extract(&self, text: &str) -> Vec<FindingMatch> {
        let mut out = Vec::new();
        for kind in FindingKind::ALL {
            let candidates = match kind {
                FindingKind::Flag => flags(text),
                FindingKind::Credential => credentials(text),
                FindingKind::Hash => hashes(text),
                FindingKind::Ip => ips(text),
                FindingKind::Host => hosts(text),
                FindingKind::Custom => self.customs(text),
            };
            out.extend(candidates.into_iter().map(|c| FindingMatch {
                kind,
                value: c.value,
                confidence: c.confidence,
            }));
        }
        out
    }

    fn customs(&self, text: &str) -> Vec<Candidate> {
        let mut accepted = Vec::new();
        for matcher in &self.custom {
            let found = matcher
                .regex
                .captures_iter(text)
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    let value = caps.get(1).unwrap_or(whole).as_str().to_string();
                    (!value.is_empty()).then_some(Candidate {
                        span: whole.range(),
                        value,
                        confidence: matcher.confidence,
                    })
                })
                .collect();
            claim(&mut accepted, found);
        }
        finish(accepted)
    }
}

/// Add `found` to `accepted`, dropping anything overlapping an earlier claim.
fn claim(accepted: &mut Vec<Candidate>, found: Vec<Candidate>) {
    for candidate in found {
        let overlaps = accepted
            .iter()
            .any(|a| candidate.span.start < a.span.end && a.span.start < candidate.span.end);
        if !overlaps {
            accepted.push(candidate);
        }
    }
}

fn finish(mut accepted: Vec<Candidate>) -> Vec<Candidate> {
    accepted.sort_by_key(|c| c.span.start);
    accepted
}

/// True when the match at `span` is embedded in a longer dotted token
/// (`1.2.3.4.5`, `box.htb.example`).
fn dotted_continuation(text: &str, span: &Range<usize>) -> bool {
    let before = text.get(..span.start).and_then(|s| s.chars().next_back());
    let mut after = text.get(span.end..).unwrap_or("").chars();
    let dot_after = after.next() == Some('.') && after.next().is_some_and(|c| c.is_ascii_alphanumeric());
    before == Some('.') || dot_after
}

fn flags(text: &str) -> Vec<Candidate> {
    FLAG_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?.as_str().trim();
            (!inner.is_empty()).then(|| Candidate {
                span: whole.range(),
                value: inner.to_string(),
                confidence: FLAG_CONFIDENCE,
            })
        })
        .collect()
}

fn ips(text: &str) -> Vec<Candidate> {
    let mut accepted = Vec::new();

    let v4 = IPV4_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if dotted_continuation(text, &whole.range()) {
                return None;
            }
            for i in 1..=4 {
                caps.get(i)?.as_str().parse::<u8>().ok()?;
            }
            if let Some(port) = caps.get(5) {
                let port: u16 = port.as_str().parse().ok()?;
                if port == 0 {
                    return None;
                }
            }
            Some(Candidate {
                span: whole.range(),
                value: whole.as_str().to_string(),
                confidence: IPV4_CONFIDENCE,
            })
        })
        .collect();
    claim(&mut accepted, v4);

    let v6 = IPV6_RE
        .find_iter(text)
        .filter_map(|m| {
            let s = m.as_str();
            if !s.chars().any(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            s.parse::<Ipv6Addr>().ok()?;
            Some(Candidate {
                span: m.range(),
                value: s.to_ascii_lowercase(),
                confidence: IPV6_CONFIDENCE,
            })
        })
        .collect();
    claim(&mut accepted, v6);

    finish(accepted)
}

fn hashes(text: &str) -> Vec<Candidate> {
    let mut accepted = Vec::new();
    let crypt = CRYPT_HASH_RE
        .find_iter(text)
        .map(|m| Candidate {
            span: m.range(),
            value: m.as_str().to_string(),
            confidence: CRYPT_HASH_CONFIDENCE,
        })
        .collect();
    claim(&mut accepted, crypt);

    let hex = HEX_HASH_RE
        .find_iter(text)
        .map(|m| Candidate {
            span: m.range(),
            value: m.as_str().to_ascii_lowercase(),
            confidence: HEX_HASH_CONFIDENCE,
        })
        .collect();
    claim(&mut accepted, hex);
    finish(accepted)
}

fn credentials(text: &str) -> Vec<Candidate> {
    let mut accepted = Vec::new();

    let pairs = CRED_PAIR_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Candidate {
                span: whole.range(),
                value: format!("{}:{}", caps.get(1)?.as_str(), caps.get(2)?.as_str()),
                confidence: CRED_PAIR_CONFIDENCE,
            })
        })
        .collect();
    claim(&mut accepted, pairs);

    let passwords = PASSWORD_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Candidate {
                span: whole.range(),
                value: caps.get(1)?.as_str().to_string(),
                confidence: PASSWORD_CONFIDENCE,
            })
        })
        .collect();
    claim(&mut accepted, passwords);

    let bare = TOKEN_RE
        .find_iter(text)
        .filter_map(|m| {
            let token = m.as_str().trim_end_matches(['.', '!', '?']);
            let caps = BARE_CRED_RE.captures(token)?;
            let secret = caps.get(2)?.as_str();
            // host:port and similar.
            if secret.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let user = caps.get(1)?.as_str();
            if user.contains('.') && HOST_RE.is_match(user) {
                return None;
            }
            Some(Candidate {
                span: m.start()..m.start() + token.len(),
                value: token.to_string(),
                confidence: BARE_CRED_CONFIDENCE,
            })
        })
        .collect();
    claim(&mut accepted, bare);

    finish(accepted)
}

fn hosts(text: &str) -> Vec<Candidate> {
    HOST_RE
        .find_iter(text)
        .filter(|m| !dotted_continuation(text, &m.range()))
        .map(|m| Candidate {
            span: m.range(),
            value: m.as_str().to_ascii_lowercase(),
            confidence: HOST_CONFIDENCE,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(matches: &[FindingMatch], kind: FindingKind) -> Vec<String> {
        matches
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.value.clone())
            .collect()
    }

    #[test]
    fn flag_value_is_inner_text() {
        let found = FindingExtractor::new().extract("got it: HTB{s0me_fl4g} and picoCTF{x}");
        assert_eq!(values(&found, FindingKind::Flag), vec!["s0me_fl4g", "x"]);
        assert!(found.iter().all(|m| m.kind != FindingKind::Flag || m.confidence == 0.95));
    }

    #[test]
    fn repeated_flags_are_all_reported() {
        let found = FindingExtractor::new().extract("flag{abc123} ... flag{abc123}");
        assert_eq!(values(&found, FindingKind::Flag), vec!["abc123", "abc123"]);
    }

    #[test]
    fn ipv4_validation_and_ports() {
        let found = FindingExtractor::new()
            .extract("targets 10.10.11.42:8080, 192.168.1.1 and 999.1.1.1, version 1.2.3.4.5");
        assert_eq!(
            values(&found, FindingKind::Ip),
            vec!["10.10.11.42:8080", "192.168.1.1"]
        );
    }

    #[test]
    fn ipv6_validated() {
        let found = FindingExtractor::new().extract("listening on fe80::1ff:fe23:4567:890a and 12:30:45");
        assert_eq!(values(&found, FindingKind::Ip), vec!["fe80::1ff:fe23:4567:890a"]);
    }

    #[test]
    fn hashes_by_length_and_crypt() {
        let md5 = "5f4dcc3b5aa765d61d8327deb882cf99";
        let odd = "5f4dcc3b5aa765d61d8327deb882cf99ab";
        let crypt = "$6$salt1234$abcdefghijklmnopqrstuvwxyz0123456789ABCDEF./";
        let text = format!("md5 {md5} not {odd} shadow {crypt}");
        let found = FindingExtractor::new().extract(&text);
        let hashes: Vec<_> = found.iter().filter(|m| m.kind == FindingKind::Hash).collect();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].value, md5);
        assert_eq!(hashes[0].confidence, 0.40);
        assert_eq!(hashes[1].value, crypt);
        assert_eq!(hashes[1].confidence, 0.70);
    }

    #[test]
    fn credential_matchers_do_not_overlap() {
        let found = FindingExtractor::new().extract("creds found: user: admin pass: S3cret!");
        let creds: Vec<_> = found
            .iter()
            .filter(|m| m.kind == FindingKind::Credential)
            .collect();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].value, "admin:S3cret!");
        assert_eq!(creds[0].confidence, 0.85);
    }

    #[test]
    fn password_assignment_and_bare_pairs() {
        let found = FindingExtractor::new()
            .extract("config has password=hunter2; also try guest:guest123 on 10.0.0.1:22");
        let creds: Vec<_> = found
            .iter()
            .filter(|m| m.kind == FindingKind::Credential)
            .map(|m| (m.value.as_str(), m.confidence))
            .collect();
        assert_eq!(creds, vec![("hunter2", 0.75), ("guest:guest123", 0.55)]);
    }

    #[test]
    fn urls_and_host_ports_are_not_credentials() {
        let found = FindingExtractor::new()
            .extract("see http://box.htb/login and box.htb:8080 and localhost:3000");
        assert!(values(&found, FindingKind::Credential).is_empty());
    }

    #[test]
    fn hosts_with_ctf_tlds() {
        let found = FindingExtractor::new()
            .extract("add dev.Forge.HTB to /etc/hosts; also api.box.htb.example and index.php");
        assert_eq!(values(&found, FindingKind::Host), vec!["dev.forge.htb"]);
    }

    #[test]
    fn custom_matchers() {
        let extractor = FindingExtractor::new()
            .with_custom(r"ticket-(\d+)", 0.3)
            .unwrap()
            .with_custom(r"JIRA-\d+", 2.0)
            .unwrap();
        let found = extractor.extract("see ticket-42 and JIRA-7");
        let customs: Vec<_> = found
            .iter()
            .filter(|m| m.kind == FindingKind::Custom)
            .map(|m| (m.value.as_str(), m.confidence))
            .collect();
        assert_eq!(customs, vec![("42", 0.3), ("JIRA-7", 1.0)]);

        assert!(FindingExtractor::new().with_custom("(", 0.5).is_err());
    }

    #[test]
    fn plain_prose_has_no_findings() {
        assert!(
            FindingExtractor::new()
                .extract("Let's enumerate the web server first.")
                .is_empty()
        );
    }

    #[test]
    fn kind_ranks_descend() {
        let ranks: Vec<u8> = FindingKind::ALL.iter().map(|k| k.rank()).collect();
        assert!(ranks.windows(2).all(|w| w[0] > w[1]));
        assert!(FindingKind::Flag.outranks_or_equals(FindingKind::Credential));
        assert!(!FindingKind::Hash.outranks_or_equals(FindingKind::Credential));
    }
}
