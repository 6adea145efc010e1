//! Importance scoring for stored messages.
//!
//! `score = finding + role + technical + recency`, clamped to `[0, 1]`.
//! Only the recency term changes after insertion.

use crate::Role;
use crate::context::findings::FindingKind;
use regex::Regex;
use std::sync::LazyLock;

pub const RECENCY_WEIGHT: f64 = 0.20;
pub const RECENCY_DECAY: f64 = 0.8;
pub const TECHNICAL_BONUS: f64 = 0.10;

#[allow(clippy::expect_used)]
static TECHNICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ```
        | \bCVE-\d{4}-\d{4,}\b
        | \b(?:exploit|payload|shellcode|buffer\ overflow|sql\ injection|rce|lfi|xss|ssrf|privesc|reverse\ shell)\b
        | \b(?:nmap|gobuster|ffuf|hydra|sqlmap|burp|metasploit|msfconsole|john|hashcat|nikto|linpeas)\b",
    )
    .expect("valid regex")
});

/// Weight of a message's most important finding kind.
pub fn finding_weight(kind: FindingKind) -> f64 {
    match kind {
        FindingKind::Flag => 0.45,
        FindingKind::Credential => 0.35,
        FindingKind::Hash => 0.25,
        FindingKind::Ip => 0.15,
        FindingKind::Host => 0.10,
        FindingKind::Custom => 0.05,
    }
}

pub fn role_weight(role: Role) -> f64 {
    match role {
        Role::Assistant => 0.15,
        Role::System => 0.10,
        Role::User => 0.05,
    }
}

/// Code blocks, CVE ids, exploit vocabulary and CTF tool names.
pub fn is_technical(text: &str) -> bool {
    TECHNICAL_RE.is_match(text)
}

/// Categories named by a bare keyword anywhere in the text.
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("web", "web exploitation"),
    ("reverse", "reverse engineering"),
    ("crypto", "cryptography"),
    ("forensic", "forensics"),
    ("pwn", "binary exploitation"),
];

/// Topic labels of a message: the tool names, CVE ids and vulnerability
/// terms that make it technical, then keyword categories. Lowercase,
/// deduplicated, in order of appearance.
pub fn topics(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let terms = TECHNICAL_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|m| !m.starts_with('`'))
        .map(str::to_lowercase);
    let lower = text.to_lowercase();
    let categories = CATEGORY_KEYWORDS
        .iter()
        .filter(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| category.to_string());
    for topic in terms.chain(categories) {
        if !out.contains(&topic) {
            out.push(topic);
        }
    }
    out
}

/// Everything except recency.
pub fn base_score(role: Role, text: &str, kinds: impl IntoIterator<Item = FindingKind>) -> f64 {
    let finding = kinds
        .into_iter()
        .map(finding_weight)
        .fold(0.0, f64::max);
    let technical = if is_technical(text) { TECHNICAL_BONUS } else { 0.0 };
    finding + role_weight(role) + technical
}

/// Recency term for a message `distance` insertions behind the newest.
pub fn recency(distance: usize) -> f64 {
    RECENCY_WEIGHT * RECENCY_DECAY.powi(distance.min(i32::MAX as usize) as i32)
}

pub fn importance(base: f64, distance: usize) -> f64 {
    (base + recency(distance)).clamp(0.0, 1.0)
}
