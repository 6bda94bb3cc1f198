//! BM25 full-text search engine.
//!
//! Implements Okapi BM25 scoring with an inverted index for keyword search.
//! Tokenization is pluggable through [`Tokenizer`]; the default lowercases,
//! drops stop words and short tokens, and can optionally stem.

/// Inverted index data structure with postings sets.
pub mod inverted_index;
/// BM25 Okapi scoring and query execution.
pub mod scorer;
/// Tokenizer trait and default implementation.
pub mod tokenizer;

pub use inverted_index::{Bm25Document, InvertedIndex};
pub use scorer::{bm25_search, Bm25Params};
pub use tokenizer::{DefaultTokenizer, Tokenizer};

use crate::search::types::ScoredId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serialized state of a [`Bm25Index`]. Document frequencies and lengths are
/// recomputed from the documents on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bm25Snapshot {
    pub params: Bm25Params,
    pub documents: Vec<Bm25Document>,
}

/// Keyword index: tokenizer + inverted index + scoring parameters.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    params: Bm25Params,
    tokenizer: Arc<dyn Tokenizer>,
    inverted: InvertedIndex,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self::with_tokenizer(params, Arc::new(DefaultTokenizer::default()))
    }

    pub fn with_tokenizer(params: Bm25Params, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            params,
            tokenizer,
            inverted: InvertedIndex::new(),
        }
    }

    pub fn params(&self) -> &Bm25Params {
        &self.params
    }

    /// Index `text` under `id`, replacing any previous entry for that id.
    pub fn add(&mut self, id: impl Into<String>, text: &str) {
        let tokens = self.tokenizer.tokenize(text);
        self.inverted
            .insert(Bm25Document::new(id.into(), text.to_string(), tokens));
    }

    /// Remove `id`. Returns `false` if it was not indexed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.inverted.remove(id).is_some()
    }

    /// Top `k` documents for `query`, descending by score. Documents sharing
    /// no term with the query are never returned.
    pub fn search(&self, query: &str, k: usize) -> Vec<ScoredId> {
        let terms = self.tokenizer.tokenize(query);
        bm25_search(&self.inverted, &terms, &self.params, k)
    }

    pub fn len(&self) -> usize {
        self.inverted.document_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inverted.documents.contains_key(id)
    }

    pub fn document(&self, id: &str) -> Option<&Bm25Document> {
        self.inverted.documents.get(id)
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.inverted.document_frequency(term)
    }

    pub fn average_document_length(&self) -> f32 {
        self.inverted.average_doc_length()
    }

    pub fn clear(&mut self) {
        self.inverted.clear();
    }

    pub fn to_snapshot(&self) -> Bm25Snapshot {
        let mut documents: Vec<Bm25Document> =
            self.inverted.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Bm25Snapshot {
            params: self.params,
            documents,
        }
    }

    /// Rebuild from a snapshot using `tokenizer` for future queries. Stored
    /// token lists are trusted; term frequencies are recomputed from them.
    pub fn from_snapshot(snapshot: Bm25Snapshot, tokenizer: Arc<dyn Tokenizer>) -> Self {
        let mut index = Self::with_tokenizer(snapshot.params, tokenizer);
        for doc in snapshot.documents {
            index
                .inverted
                .insert(Bm25Document::new(doc.id, doc.text, doc.tokens));
        }
        index
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_snapshot())
    }

    /// Restore with the default tokenizer.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let snapshot: Bm25Snapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot, Arc::new(DefaultTokenizer::default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_brown_fox() {
        let mut index = Bm25Index::default();
        index.add("1", "the quick brown fox");
        index.add("2", "lazy dog sleeps");
        let hits = index.search("fox", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "1");
        assert!(hits[0].score > 0.0);
        assert!(index.search("zebra", 10).is_empty());
    }

    #[test]
    fn test_update_semantics() {
        let mut index = Bm25Index::default();
        index.add("a", "apple banana");
        index.add("a", "cherry");
        assert_eq!(index.len(), 1);
        assert_eq!(index.document_frequency("apple"), 0);
        assert!(index.search("apple", 5).is_empty());
        assert_eq!(index.search("cherry", 5)[0].id, "a");
    }

    #[test]
    fn test_remove_never_negative() {
        let mut index = Bm25Index::default();
        index.add("a", "apple");
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.document_frequency("apple"), 0);
        assert_eq!(index.average_document_length(), 0.0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_document_accessor() {
        let mut index = Bm25Index::default();
        index.add("a", "Hello hello world");
        let doc = index.document("a").unwrap();
        assert_eq!(doc.tokens, vec!["hello", "hello", "world"]);
        assert_eq!(doc.term_frequencies["hello"], 2);
        assert_eq!(doc.text, "Hello hello world");
    }

    #[test]
    fn test_json_roundtrip_same_rankings() {
        let mut index = Bm25Index::new(Bm25Params { k1: 1.2, b: 0.6 });
        let corpus = [
            ("r1", "rust programming systems language fast"),
            ("p1", "python programming scripting easy"),
            ("j1", "java enterprise programming verbose"),
            ("r2", "rust memory safety zero cost abstractions"),
        ];
        for (id, text) in corpus {
            index.add(id, text);
        }
        let restored = Bm25Index::from_json(&index.to_json().unwrap()).unwrap();
        assert_eq!(restored.params(), index.params());
        for query in ["rust", "programming", "rust programming", "memory fast", "nothing"] {
            assert_eq!(restored.search(query, 10), index.search(query, 10), "query {query}");
        }
    }

    #[test]
    fn test_custom_tokenizer() {
        #[derive(Debug)]
        struct Whitespace;
        impl Tokenizer for Whitespace {
            fn tokenize(&self, text: &str) -> Vec<String> {
                text.split_whitespace().map(str::to_string).collect()
            }
        }
        let mut index = Bm25Index::with_tokenizer(Bm25Params::default(), Arc::new(Whitespace));
        index.add("a", "The A");
        assert_eq!(index.search("The", 1)[0].id, "a");
        assert!(index.search("the", 1).is_empty());
    }
}
