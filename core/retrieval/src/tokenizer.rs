/// Estimate the token count of `text` for budget filtering.
///
/// Character-based (one token per four characters, rounded up), which
/// keeps the estimate deterministic and monotone under concatenation:
/// `count(a + b) >= count(a)`. It does not need to match any specific
/// model tokenizer.
pub fn count_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_counts() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("abcd"), 1);
        assert_eq!(count_tokens("abcde"), 2);
        assert_eq!(count_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_monotone_under_concatenation() {
        let parts = ["Alice", " works", " at Google", " in Mountain View."];
        let mut acc = String::new();
        let mut last = 0;
        for part in parts {
            acc.push_str(part);
            let count = count_tokens(&acc);
            assert!(count >= last);
            last = count;
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Deployed the Foobar-9000 to prod on Tuesday";
        assert_eq!(count_tokens(text), count_tokens(text));
    }
}
