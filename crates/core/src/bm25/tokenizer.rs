//! Pluggable tokenization for the BM25 index.
//!
//! The default tokenizer lowercases, splits on non-alphanumeric runs, drops
//! short tokens and stop words, and can apply a light suffix-stripping stemmer.
//! Word boundaries are found as byte spans over one lowercased buffer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "has",
        "have", "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "such",
        "that", "the", "their", "then", "there", "these", "they", "this", "to", "was", "were",
        "will", "with",
    ]
    .into_iter()
    .collect()
});

/// Splits text into index terms. Implementations must be deterministic:
/// the same text always yields the same terms.
pub trait Tokenizer: Debug + Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Lowercasing tokenizer with stop words and optional stemming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultTokenizer {
    /// Tokens with fewer characters are dropped.
    pub min_token_len: usize,
    pub stop_words: HashSet<String>,
    /// Strip common English suffixes (`ing`, `ed`, `ly`, `es`, `s`).
    pub stem: bool,
}

impl Default for DefaultTokenizer {
    fn default() -> Self {
        Self {
            min_token_len: crate::config::BM25_MIN_TOKEN_LEN,
            stop_words: STOP_WORDS.iter().map(|w| w.to_string()).collect(),
            stem: false,
        }
    }
}

impl DefaultTokenizer {
    pub fn with_stemming() -> Self {
        Self {
            stem: true,
            ..Self::default()
        }
    }

    fn keep(&self, word: &str) -> bool {
        word.chars().count() >= self.min_token_len && !self.stop_words.contains(word)
    }
}

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let buffer = text.to_lowercase();
        word_spans(&buffer)
            .filter_map(|(s, e)| {
                let word = &buffer[s..e];
                if !self.keep(word) {
                    return None;
                }
                let term = if self.stem { stem(word) } else { word };
                Some(term.to_string())
            })
            .collect()
    }
}

/// Byte spans of maximal alphanumeric runs.
fn word_spans(buffer: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
    let mut start: Option<usize> = None;
    let mut chars = buffer.char_indices().chain(std::iter::once((buffer.len(), ' ')));
    std::iter::from_fn(move || {
        for (i, c) in chars.by_ref() {
            if c.is_alphanumeric() {
                start.get_or_insert(i);
            } else if let Some(s) = start.take() {
                return Some((s, i));
            }
        }
        None
    })
}

/// Light suffix stripper. Leaves at least three characters of stem and never
/// strips the `s` from words ending in `ss`.
pub fn stem(word: &str) -> &str {
    for suffix in ["ing", "ed", "ly", "es"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.chars().count() >= 3 {
                return base;
            }
        }
    }
    if let Some(base) = word.strip_suffix('s') {
        if !base.ends_with('s') && base.chars().count() >= 3 {
            return base;
        }
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let words = DefaultTokenizer::default().tokenize("The quick brown fox jumps over the lazy dog");
        assert!(!words.contains(&"the".to_string()));
        assert_eq!(words[..3], ["quick", "brown", "fox"]);
    }

    #[test]
    fn test_splits_on_punctuation_and_drops_short() {
        let words = DefaultTokenizer::default().tokenize("e-mail: x@y.io, C3PO!");
        assert_eq!(words, vec!["mail", "io", "c3po"]);
    }

    #[test]
    fn test_unicode_lowercase() {
        let words = DefaultTokenizer::default().tokenize("ÉCOLE Straße");
        assert_eq!(words, vec!["école", "straße"]);
    }

    #[test]
    fn test_min_token_len_configurable() {
        let tok = DefaultTokenizer {
            min_token_len: 4,
            ..DefaultTokenizer::default()
        };
        assert_eq!(tok.tokenize("cat horse dog zebra"), vec!["horse", "zebra"]);
    }

    #[test]
    fn test_stemmer() {
        assert_eq!(stem("sleeps"), "sleep");
        assert_eq!(stem("jumping"), "jump");
        assert_eq!(stem("jumped"), "jump");
        assert_eq!(stem("quickly"), "quick");
        assert_eq!(stem("boxes"), "box");
        assert_eq!(stem("glass"), "glass");
        assert_eq!(stem("is"), "is");
        assert_eq!(stem("sing"), "sing");
    }

    #[test]
    fn test_stemming_tokenizer() {
        let words = DefaultTokenizer::with_stemming().tokenize("Dogs were sleeping");
        assert_eq!(words, vec!["dog", "sleep"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(DefaultTokenizer::default().tokenize("").is_empty());
        assert!(DefaultTokenizer::default().tokenize("  ,;  ").is_empty());
    }
}
