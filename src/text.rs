//! Tokenization and term normalization shared by the rule generator, the
//! TF-IDF vectorizer, and the explainer.

use std::collections::HashSet;

use crate::stopwords;

/// Split text into lowercase alphanumeric tokens. Punctuation and
/// whitespace never survive tokenization.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                current.push(lower);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Tokenize and drop the language's stopwords.
pub fn content_tokens(text: &str, language: &str) -> Vec<String> {
    let stop: HashSet<&str> = stopwords::for_language(language).iter().copied().collect();
    tokenize(text)
        .into_iter()
        .filter(|t| !stop.contains(t.as_str()))
        .collect()
}

/// Split on whitespace keeping the original word forms, minus stopwords.
///
/// The explainer removes *surface* words from a span and re-predicts, so
/// it needs the words as written rather than normalized terms.
pub fn surface_words(text: &str, language: &str) -> Vec<String> {
    let stop: HashSet<&str> = stopwords::for_language(language).iter().copied().collect();
    text.split_whitespace()
        .filter(|w| {
            let normalized: String = w
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(|c| c.to_lowercase())
                .collect();
            !normalized.is_empty() && !stop.contains(normalized.as_str())
        })
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_strips_punctuation_and_lowercases() {
        assert_eq!(
            tokenize("The team was slow."),
            vec!["the", "team", "was", "slow"]
        );
    }

    #[test]
    fn tokenize_handles_unicode() {
        assert_eq!(tokenize("Über-Maß!"), vec!["über", "maß"]);
    }

    #[test]
    fn content_tokens_drop_stopwords() {
        assert_eq!(
            content_tokens("The team was slow.", "en"),
            vec!["team", "slow"]
        );
    }

    #[test]
    fn surface_words_keep_original_casing() {
        assert_eq!(
            surface_words("The Team was slow.", "en"),
            vec!["Team", "slow."]
        );
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("  ... ").is_empty());
        assert!(content_tokens("", "en").is_empty());
    }
}
