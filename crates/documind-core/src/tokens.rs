//! Token estimation.
//!
//! Budgets are enforced against a fixed chars-per-token estimate rather than a
//! model tokenizer so that optimization stays deterministic and offline.

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`, rounded up. Empty text is zero tokens.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_partial_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 4 chars, 8 bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }
}
