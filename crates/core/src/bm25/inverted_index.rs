//! Inverted index for BM25 full-text search.
//!
//! Holds every indexed [`Bm25Document`] plus a term → document-id postings map.
//! Document frequency is the size of a term's postings set, so it can never
//! go negative; empty sets are dropped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A document as seen by the keyword index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bm25Document {
    pub id: String,
    pub tokens: Vec<String>,
    pub term_frequencies: BTreeMap<String, u32>,
    pub length: usize,
    pub text: String,
}

impl Bm25Document {
    pub fn new(id: String, text: String, tokens: Vec<String>) -> Self {
        let term_frequencies = term_frequencies(&tokens);
        Self {
            id,
            length: tokens.len(),
            tokens,
            term_frequencies,
            text,
        }
    }
}

/// Count occurrences of each token.
pub fn term_frequencies(tokens: &[String]) -> BTreeMap<String, u32> {
    let mut tf = BTreeMap::new();
    for token in tokens {
        *tf.entry(token.clone()).or_insert(0) += 1;
    }
    tf
}

/// Inverted index mapping terms to the ids of documents containing them.
///
/// Supports incremental document addition and removal. Document lengths
/// are tracked for BM25 length normalization.
#[derive(Debug, Default, Clone)]
pub struct InvertedIndex {
    pub(crate) documents: HashMap<String, Bm25Document>,
    pub(crate) postings: HashMap<String, BTreeSet<String>>,
    pub(crate) total_length: u64,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document, replacing any previous entry with the same id.
    pub fn insert(&mut self, doc: Bm25Document) {
        self.remove(&doc.id);
        for term in doc.term_frequencies.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(doc.id.clone());
        }
        self.total_length += doc.length as u64;
        self.documents.insert(doc.id.clone(), doc);
    }

    /// Remove a document by id, returning it if it was indexed.
    pub fn remove(&mut self, id: &str) -> Option<Bm25Document> {
        let doc = self.documents.remove(id)?;
        for term in doc.term_frequencies.keys() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length = self.total_length.saturating_sub(doc.length as u64);
        Some(doc)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Number of documents containing `term`.
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, BTreeSet::len)
    }

    /// Returns the average document length across all indexed documents.
    pub fn average_doc_length(&self) -> f32 {
        if self.documents.is_empty() {
            return 0.0;
        }
        self.total_length as f32 / self.documents.len() as f32
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.postings.clear();
        self.total_length = 0;
    }
}
