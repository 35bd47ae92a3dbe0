//! Context Window Truncation
//!
//! Slices a document around the cursor so the prompt stays within a token
//! budget. Token counts are estimated, not exact: every CJK ideograph counts
//! as one token and every whitespace-separated word containing a letter
//! counts as 1.3 tokens.
//!
//! When one side exceeds its budget, the side is cut proportionally, keeping
//! the characters nearest to the cursor: the tail of the text before it and
//! the head of the text after it.

use serde::{Deserialize, Serialize};

/// Token budgets on either side of the cursor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextWindowConfig {
    /// Budget for the text before the cursor
    pub before_tokens: usize,
    /// Budget for the text after the cursor
    pub after_tokens: usize,
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            before_tokens: 1536,
            after_tokens: 256,
        }
    }
}

/// The text surrounding the cursor after truncation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextWindow {
    /// Text before the cursor (its tail, when truncated)
    pub before: String,
    /// Text after the cursor (its head, when truncated)
    pub after: String,
}

/// Token-aware truncator
#[derive(Clone, Debug, Default)]
pub struct ContextWindowTruncator {
    config: ContextWindowConfig,
}

impl ContextWindowTruncator {
    /// Create a truncator with the given budgets
    #[must_use]
    pub fn new(config: ContextWindowConfig) -> Self {
        Self { config }
    }

    /// Current budgets
    #[must_use]
    pub fn config(&self) -> ContextWindowConfig {
        self.config
    }

    /// Split `text` at `cursor` (a character index) and trim both sides to budget
    ///
    /// A cursor past the end of the text is treated as the end.
    #[must_use]
    pub fn window(&self, text: &str, cursor: usize) -> ContextWindow {
        let split = char_to_byte(text, cursor);
        let (before, after) = text.split_at(split);

        ContextWindow {
            before: keep_tail(before, self.config.before_tokens),
            after: keep_head(after, self.config.after_tokens),
        }
    }
}

/// Estimate the token count of a piece of text
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let words = text
        .split_whitespace()
        .filter(|word| word.chars().any(char::is_alphabetic))
        .count();

    (cjk as f64 + words as f64 * 1.3) as usize
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn char_to_byte(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(byte, _)| byte)
}

/// Number of characters to keep so roughly `budget` tokens remain
fn chars_to_keep(text: &str, budget: usize) -> Option<usize> {
    let estimated = estimate_tokens(text);
    if estimated <= budget {
        return None;
    }
    let total_chars = text.chars().count();
    let chars_per_token = total_chars as f64 / estimated as f64;
    Some((budget as f64 * chars_per_token) as usize)
}

fn keep_tail(text: &str, budget: usize) -> String {
    match chars_to_keep(text, budget) {
        None => text.to_string(),
        Some(keep) => {
            let total = text.chars().count();
            let start = char_to_byte(text, total.saturating_sub(keep));
            text[start..].to_string()
        }
    }
}

fn keep_head(text: &str, budget: usize) -> String {
    match chars_to_keep(text, budget) {
        None => text.to_string(),
        Some(keep) => text[..char_to_byte(text, keep)].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn truncator(before: usize, after: usize) -> ContextWindowTruncator {
        ContextWindowTruncator::new(ContextWindowConfig {
            before_tokens: before,
            after_tokens: after,
        })
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // Four ideographs plus one word containing letters
        assert_eq!(estimate_tokens("你好世界"), 5);
        // 10 words * 1.3
        assert_eq!(estimate_tokens("one two three four five six seven eight nine ten"), 13);
        // Pure numbers and punctuation are not words
        assert_eq!(estimate_tokens("123 456 --- ..."), 0);
        assert_eq!(estimate_tokens("hello 世界"), 4);
    }

    #[test]
    fn test_short_text_is_untouched() {
        let window = truncator(1536, 256).window("Hello brave new world", 6);
        assert_eq!(window.before, "Hello ");
        assert_eq!(window.after, "brave new world");
    }

    #[test]
    fn test_cursor_past_end() {
        let window = truncator(1536, 256).window("abc def", 100);
        assert_eq!(window.before, "abc def");
        assert_eq!(window.after, "");
    }

    #[test]
    fn test_before_keeps_text_nearest_cursor() {
        // 4 words, 19 chars: estimated 5 tokens, 3.8 chars per token
        let text = "aaaa bbbb cccc dddd";
        let window = truncator(2, 256).window(text, 19);
        assert_eq!(window.before, "cc dddd");
        assert_eq!(window.after, "");
    }

    #[test]
    fn test_after_keeps_text_nearest_cursor() {
        let text = "aaaa bbbb cccc dddd";
        let window = truncator(1536, 2).window(text, 0);
        assert_eq!(window.before, "");
        assert_eq!(window.after, "aaaa bb");
    }

    #[test]
    fn test_cursor_in_middle_of_multibyte_text() {
        let text = "前文前文前文光标后文后文后文";
        let window = truncator(2, 2).window(text, 6);
        assert_eq!(window.before, "文");
        assert_eq!(window.after, "光");
    }

    #[test]
    fn test_truncated_side_fits_budget() {
        let text = "word ".repeat(2_000);
        let truncator = truncator(100, 50);
        let window = truncator.window(&text, text.chars().count() / 2);

        assert!(estimate_tokens(&window.before) <= 100 + 2);
        assert!(estimate_tokens(&window.after) <= 50 + 2);
        assert!(text[..text.len() / 2].ends_with(&window.before));
        assert!(text[text.len() / 2..].starts_with(&window.after));
    }

    #[test]
    fn test_default_budgets() {
        let config = ContextWindowConfig::default();
        assert_eq!(config.before_tokens, 1536);
        assert_eq!(config.after_tokens, 256);
    }
}
