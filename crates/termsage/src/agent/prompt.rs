//! System prompts and the standalone prompts for command help.
//!
//! [`SystemPromptBuilder`] assembles multi-section prompts; sections with
//! empty content are skipped. The conversation prompt is the base persona
//! plus a "Known findings" section, so findings stay in front of the model
//! even after the messages that produced them were compressed.

use crate::ChatMessage;
use crate::context::findings::{Finding, FindingKind};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are TermSage, a specialized CTF (Capture The Flag) assistant.
Your expertise includes:
- Penetration testing and exploitation techniques
- Reverse engineering and binary analysis
- Web application security testing
- Cryptography and steganography
- Network analysis and enumeration
- Common CTF tools (nmap, burp suite, gdb, radare2, etc.)

Always provide practical, actionable advice focused on CTF challenges.
Prioritize security and ethical hacking practices.";

/// Persona for the one-shot command prompts.
const EXPERT_PROMPT: &str = "You are a CTF and security expert assistant.";

/// Characters of stderr included in a failure explanation.
pub const MAX_STDERR_CHARS: usize = 2000;

/// Findings listed per kind in the system prompt.
const MAX_FINDINGS_PER_KIND: usize = 10;

/// Builder for multi-section system prompts.
///
/// ```ignore
/// let prompt = SystemPromptBuilder::new("You are a helpful agent.")
///     .section("Target", "10.10.11.42")
///     .section_if(false, "Hidden", || "never shown".into())
///     .section_opt("Notes", None::<String>)
///     .build();
///
/// assert!(prompt.contains("## Target"));
/// assert!(!prompt.contains("## Hidden"));
/// ```
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    /// Create a new builder with an initial preamble section (no heading).
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            sections: vec![preamble.into()],
        }
    }

    /// Append a `## heading` section. Skipped if `content` is empty.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    /// Append a section only if `condition` holds.
    pub fn section_if(
        self,
        condition: bool,
        heading: &str,
        content_fn: impl FnOnce() -> String,
    ) -> Self {
        if condition {
            self.section(heading, content_fn())
        } else {
            self
        }
    }

    /// Append a section only if the content is `Some`.
    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    /// Sections joined with blank lines.
    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

/// The conversation system prompt: `base` plus the known findings.
pub fn conversation_system_prompt(base: &str, findings: &[Finding]) -> String {
    SystemPromptBuilder::new(base)
        .section_if(!findings.is_empty(), "Known findings", || {
            findings_section(findings)
        })
        .build()
}

fn findings_section(findings: &[Finding]) -> String {
    let mut lines = Vec::new();
    for kind in FindingKind::ALL {
        let values: Vec<&str> = findings
            .iter()
            .filter(|f| f.kind == kind)
            .take(MAX_FINDINGS_PER_KIND)
            .map(|f| f.value.as_str())
            .collect();
        if !values.is_empty() {
            lines.push(format!("- {kind}: {}", values.join(", ")));
        }
    }
    lines.join("\n")
}

/// Standalone prompt asking why a shell command failed.
pub fn failure_prompt(command: &str, exit_code: i32, stderr_excerpt: &str) -> Vec<ChatMessage> {
    let mut stderr: String = stderr_excerpt.trim().chars().take(MAX_STDERR_CHARS).collect();
    if stderr_excerpt.trim().chars().count() > MAX_STDERR_CHARS {
        stderr.push_str("\n[truncated]");
    }
    if stderr.is_empty() {
        stderr.push_str("(no output on stderr)");
    }
    let user = format!(
        "The command failed: {command}\n\
         Exit code: {exit_code}\n\
         Error: {stderr}\n\n\
         Please explain:\n\
         1. Why it failed\n\
         2. How to fix it\n\
         3. Alternative approaches\n\n\
         Keep it brief and practical for CTF work."
    );
    vec![ChatMessage::system(EXPERT_PROMPT), ChatMessage::user(user)]
}

/// Standalone prompt asking what a command does and how it is used in CTFs.
pub fn command_help_prompt(command: &str) -> Vec<ChatMessage> {
    let user = format!(
        "As a CTF assistant, help with this command: {command}\n\n\
         Provide:\n\
         1. What this command does\n\
         2. Common CTF usage examples\n\
         3. Important flags/options\n\
         4. Safety considerations\n\n\
         Keep it concise and practical."
    );
    vec![ChatMessage::system(EXPERT_PROMPT), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use crate::context::store::MessageId;

    fn finding(kind: FindingKind, value: &str) -> Finding {
        Finding {
            kind,
            value: value.into(),
            source_message_id: MessageId(0),
            confidence: 0.9,
        }
    }

    #[test]
    fn builder_skips_empty_sections() {
        let prompt = SystemPromptBuilder::new("Preamble")
            .section("Context", "Today is Monday.")
            .section("Empty", "")
            .section_if(true, "Active", || "yes".into())
            .section_if(false, "Inactive", || "no".into())
            .section_opt("Some", Some("x"))
            .section_opt("None", None::<String>)
            .build();

        assert!(prompt.starts_with("Preamble\n\n## Context"));
        assert!(prompt.contains("## Active"));
        assert!(prompt.contains("## Some"));
        assert!(!prompt.contains("## Empty"));
        assert!(!prompt.contains("## Inactive"));
        assert!(!prompt.contains("## None"));
    }

    #[test]
    fn conversation_prompt_lists_findings_by_rank() {
        let prompt = conversation_system_prompt(
            DEFAULT_SYSTEM_PROMPT,
            &[
                finding(FindingKind::Ip, "10.10.11.42"),
                finding(FindingKind::Flag, "abc123"),
                finding(FindingKind::Ip, "10.10.11.43"),
            ],
        );
        let flag_at = prompt.find("- flag: abc123").unwrap();
        let ip_at = prompt.find("- ip: 10.10.11.42, 10.10.11.43").unwrap();
        assert!(flag_at < ip_at);
        assert!(prompt.contains("## Known findings"));

        assert_eq!(
            conversation_system_prompt(DEFAULT_SYSTEM_PROMPT, &[]),
            DEFAULT_SYSTEM_PROMPT
        );
    }

    #[test]
    fn failure_prompt_is_standalone() {
        let messages = failure_prompt("nmap -sS 10.10.10.5", 1, "You requested a scan type which requires root privileges.");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.contains("nmap -sS 10.10.10.5"));
        assert!(messages[1].content.contains("Exit code: 1"));
        assert!(messages[1].content.contains("root privileges"));
    }

    #[test]
    fn failure_prompt_clips_stderr() {
        let noisy = "e".repeat(MAX_STDERR_CHARS + 500);
        let messages = failure_prompt("make", 2, &noisy);
        assert!(messages[1].content.contains("[truncated]"));
        assert!(messages[1].content.len() < noisy.len() + 500);

        let silent = failure_prompt("false", 1, "  ");
        assert!(silent[1].content.contains("(no output on stderr)"));
    }

    #[test]
    fn command_help_mentions_command() {
        let messages = command_help_prompt("gobuster dir -u http://box.htb");
        assert!(messages[1].content.contains("gobuster dir -u http://box.htb"));
        assert!(messages[1].content.contains("Safety considerations"));
    }
}
