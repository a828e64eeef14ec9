//! Text sanitization.
//!
//! Pure, deterministic transforms — no I/O, no shared state beyond the
//! counters `Sanitizer` keeps for front-end diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;

/// Case-insensitive, literal patterns neutralized to `[blocked]` before
/// escaping. `on\w+=` (event handler attributes) is handled by
/// `contains_event_handler_attr` since it isn't a fixed literal.
const BLOCKED_LITERALS: &[&str] = &[
    "<script",
    "javascript:",
    "<iframe",
    "<object",
    "<embed",
    "<form",
    "data:",
];

/// Control characters this sanitizer replaces with a space.
fn is_stripped_control(c: char) -> bool {
    matches!(c as u32,
        0x00..=0x08 | 0x0b | 0x0c | 0x0e..=0x1f | 0x7f..=0x9f)
}

/// Normalizes, strips, neutralizes, escapes, and truncates user-supplied text.
pub struct Sanitizer {
    blocked_pattern_hits: AtomicU64,
    truncated_count: AtomicU64,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self {
            blocked_pattern_hits: AtomicU64::new(0),
            truncated_count: AtomicU64::new(0),
        }
    }

    /// Total number of script-like patterns neutralized across all calls.
    pub fn blocked_pattern_hits(&self) -> u64 {
        self.blocked_pattern_hits.load(Ordering::Relaxed)
    }

    /// Total number of inputs truncated to `max_content_length`.
    pub fn truncated_count(&self) -> u64 {
        self.truncated_count.load(Ordering::Relaxed)
    }

    /// `sanitize(text) -> text'`
    pub fn sanitize(&self, text: &str, max_content_length: usize) -> String {
        let normalized: String = text.nfc().collect();

        let stripped: String = normalized
            .chars()
            .map(|c| if is_stripped_control(c) { ' ' } else { c })
            .collect();

        let collapsed = collapse_spaces(&stripped);

        let (neutralized, hits) = self.neutralize_patterns(&collapsed);
        if hits > 0 {
            self.blocked_pattern_hits.fetch_add(hits, Ordering::Relaxed);
        }

        let escaped = html_escape(&neutralized);
        let trimmed = escaped.trim();

        let (truncated, was_truncated) = truncate_at_boundary(trimmed, max_content_length);
        if was_truncated {
            self.truncated_count.fetch_add(1, Ordering::Relaxed);
        }
        truncated
    }

    /// `validate(text') -> {valid | reason}`. The residual-blocked-pattern
    /// check is itself skipped when `config.enable_input_sanitization` is
    /// false, matching `sanitize`'s own passthrough.
    pub fn validate(&self, text: &str, config: &Config) -> Result<(), String> {
        if text.is_empty() {
            return Err("content is empty".to_string());
        }
        if text.chars().count() > config.max_content_length {
            return Err(format!(
                "content exceeds max length of {} characters",
                config.max_content_length
            ));
        }
        if text.len() > config.max_message_size {
            return Err(format!(
                "content exceeds max encoded size of {} bytes",
                config.max_message_size
            ));
        }
        if config.enable_input_sanitization && self.contains_residual_blocked_pattern(text) {
            return Err("content still contains a blocked pattern".to_string());
        }
        let lower = text.to_lowercase();
        for word in &config.blocked_words {
            if !word.is_empty() && lower.contains(&word.to_lowercase()) {
                return Err("content contains a blocked word".to_string());
            }
        }
        Ok(())
    }

    /// `sanitize_device_name(s)`
    pub fn sanitize_device_name(&self, name: &str) -> String {
        let stripped: String = name
            .chars()
            .map(|c| if is_stripped_control(c) { ' ' } else { c })
            .collect();
        let collapsed = collapse_spaces(&stripped);
        let trimmed = collapsed.trim();
        if trimmed.is_empty() {
            "Unknown Device".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// `sanitize_address(s)`
    pub fn sanitize_address(&self, address: &str) -> String {
        address
            .chars()
            .filter(|c| c.is_ascii_hexdigit() || *c == ':' || *c == '-')
            .take(50)
            .collect()
    }

    fn neutralize_patterns(&self, text: &str) -> (String, u64) {
        let lower = text.to_lowercase();
        let mut hits = 0u64;

        // Mask every byte range covered by a blocked literal or an event
        // handler attribute, then rebuild the string replacing each masked
        // run with a single `[blocked]` marker.
        let mut masked = vec![false; text.len()];
        for pat in BLOCKED_LITERALS {
            let mut start = 0;
            while let Some(pos) = lower[start..].find(pat) {
                let abs = start + pos;
                for b in masked.iter_mut().take(abs + pat.len()).skip(abs) {
                    *b = true;
                }
                hits += 1;
                start = abs + pat.len();
                if start >= lower.len() {
                    break;
                }
            }
        }
        for (s, e) in find_event_handler_attrs(&lower) {
            for b in masked.iter_mut().take(e).skip(s) {
                *b = true;
            }
            hits += 1;
        }

        if hits == 0 {
            return (text.to_string(), 0);
        }

        let mut out = String::new();
        let bytes_indices: Vec<(usize, char)> = text.char_indices().collect();
        let mut i = 0;
        while i < bytes_indices.len() {
            let (byte_idx, ch) = bytes_indices[i];
            if masked[byte_idx] {
                out.push_str("[blocked]");
                while i < bytes_indices.len() && masked[bytes_indices[i].0] {
                    i += 1;
                }
            } else {
                out.push(ch);
                i += 1;
            }
        }
        (out, hits)
    }

    fn contains_residual_blocked_pattern(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        BLOCKED_LITERALS.iter().any(|p| lower.contains(p)) || !find_event_handler_attrs(&lower).is_empty()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Entity suffixes this sanitizer itself produces. An `&` already heading
/// one of these is left alone so a second escaping pass is a no-op — plain
/// unconditional escaping would turn `&lt;` into `&amp;lt;` and violate
/// `sanitize(sanitize(s)) == sanitize(s)`.
const KNOWN_ENTITY_SUFFIXES: &[&str] = &["amp;", "lt;", "gt;", "quot;", "#x27;"];

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(c) = rest.chars().next() {
        let c_len = c.len_utf8();
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '&' => {
                let after = &rest[c_len..];
                if KNOWN_ENTITY_SUFFIXES.iter().any(|suf| after.starts_with(suf)) {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            _ => out.push(c),
        }
        rest = &rest[c_len..];
    }
    out
}

/// Truncate at `max_len` chars, preferring the last space boundary when it
/// falls beyond 80% of the limit.
fn truncate_at_boundary(s: &str, max_len: usize) -> (String, bool) {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        return (s.to_string(), false);
    }

    let hard_cut = max_len;
    let min_boundary = (max_len as f64 * 0.8).floor() as usize;

    let mut boundary = hard_cut;
    for i in (min_boundary..hard_cut).rev() {
        if chars[i] == ' ' {
            boundary = i;
            break;
        }
    }

    (chars[..boundary].iter().collect(), true)
}

/// Matches `on\w+=` case-insensitively: "on", one-or-more word chars, "=".
fn find_event_handler_attrs(lower: &str) -> Vec<(usize, usize)> {
    let bytes = lower.as_bytes();
    let mut matches = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if &bytes[i..i + 2] == b"on" {
            let mut j = i + 2;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 2 && j < bytes.len() && bytes[j] == b'=' {
                matches.push((i, j + 1));
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    matches
}
