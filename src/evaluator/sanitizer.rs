//! Prompt-injection neutralization and length budgeting for untrusted
//! conversation content.
//!
//! Every model-backed evaluator runs transcripts through
//! [`MessageSanitizer::prepare`] before prompt assembly, so
//! un-sanitized text never reaches a model. The pass is pure and
//! total: it builds a fresh turn list and never fails.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::Turn;

/// Replacement token for neutralized injection phrases.
const SANITIZED_MARKER: &str = "[SANITIZED]";

/// Marker spliced between the head and tail of an overlong turn.
const TRUNCATION_MARKER: &str = "\n\n[... content truncated for length ...]\n\n";

/// Known prompt-injection phrases, matched case-insensitively.
const INJECTION_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "disregard previous",
    "forget everything",
    "new instructions:",
    "system:",
    "assistant:",
    "[SYSTEM]",
    "[INST]",
    "[/INST]",
    "</s>",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<system>",
    "</system>",
    "<assistant>",
    "</assistant>",
    "jailbreak",
    "pretend you are",
    "act as",
    "roleplay as",
];

static INJECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = INJECTION_PATTERNS
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i){alternation}")).expect("injection pattern alternation compiles")
});

/// Sanitizes conversation turns before they are embedded in prompts.
pub struct MessageSanitizer {
    /// Maximum characters per turn.
    max_turn_chars: usize,
    /// Maximum characters across all turns of one prompt.
    max_total_chars: usize,
}

impl Default for MessageSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSanitizer {
    pub fn new() -> Self {
        Self {
            max_turn_chars: 4000,
            max_total_chars: 15_000,
        }
    }

    /// Replace every injection phrase occurrence with `[SANITIZED]`.
    pub fn neutralize(&self, content: &str) -> String {
        INJECTION_RE.replace_all(content, SANITIZED_MARKER).into_owned()
    }

    /// Cap a single turn's content, keeping a 60% head and the tail.
    pub fn truncate(&self, content: &str) -> String {
        let char_count = content.chars().count();
        if char_count <= self.max_turn_chars {
            return content.to_string();
        }

        let keep_start = self.max_turn_chars * 6 / 10;
        // Reserve room for the marker inside the cap.
        let keep_end = self.max_turn_chars - keep_start - 50;

        let mut out = String::with_capacity(self.max_turn_chars + TRUNCATION_MARKER.len());
        out.push_str(head_chars(content, keep_start));
        out.push_str(TRUNCATION_MARKER);
        out.push_str(tail_chars(content, keep_end));
        out
    }

    /// Full pass: neutralize, cap per turn, and enforce the global
    /// budget. Turns past the budget are dropped entirely.
    pub fn prepare(&self, turns: &[Turn]) -> Vec<Turn> {
        let mut sanitized = Vec::with_capacity(turns.len());
        let mut total_chars = 0usize;

        for turn in turns {
            let content = self.truncate(&self.neutralize(&turn.content));

            total_chars += content.chars().count();
            if total_chars > self.max_total_chars {
                break;
            }

            let mut clean = turn.clone();
            clean.content = content;
            sanitized.push(clean);
        }

        sanitized
    }
}

/// First `n` characters of `s`, respecting char boundaries.
fn head_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Last `n` characters of `s`, respecting char boundaries.
fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    s.char_indices()
        .nth(count - n)
        .map(|(idx, _)| &s[idx..])
        .unwrap_or(s)
}
