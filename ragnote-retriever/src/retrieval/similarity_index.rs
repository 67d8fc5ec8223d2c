//! In-memory exact nearest-neighbor index over cosine similarity.
//!
//! The index is a cache of the record store: it is rebuilt on cold start by replaying
//! stored records and extended as fresh batches are embedded. Both paths go through
//! [`SimilarityIndex::add_vectors`].
//!
//! Every entry keeps the sequence number it was first inserted with. Updating an id
//! replaces its vector and content in place, so the entry keeps its position. Search
//! orders by descending similarity and breaks ties by that sequence number.

use crate::document::Document;
use crate::error::IndexError;
use half::f16;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Capacity used when none is configured
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// A search match: the stored document and its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug)]
struct IndexEntry {
    id: String,
    content: String,
    vector: Vec<f16>,
    norm: f32,
}

/// Fixed-capacity, fixed-dimension similarity index.
#[derive(Debug)]
pub struct SimilarityIndex {
    dimension: usize,
    capacity: usize,
    next_seq: u64,
    entries: BTreeMap<u64, IndexEntry>,
    by_id: HashMap<String, u64>,
}

impl SimilarityIndex {
    /// Create an empty index for vectors of `dimension` holding at most `capacity` documents.
    pub fn new(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity,
            next_seq: 0,
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Content stored for `id`, if indexed
    pub fn content(&self, id: &str) -> Option<&str> {
        self.by_id
            .get(id)
            .and_then(|seq| self.entries.get(seq))
            .map(|entry| entry.content.as_str())
    }

    /// Check that a batch could be inserted without changing anything.
    ///
    /// This is the same validation [`add_vectors`](Self::add_vectors) performs, so a
    /// batch that passes here is guaranteed to insert.
    pub fn validate_batch(
        &self,
        vectors: &[Vec<f16>],
        documents: &[Document],
    ) -> Result<(), IndexError> {
        if vectors.len() != documents.len() {
            return Err(IndexError::BatchMismatch {
                vectors: vectors.len(),
                documents: documents.len(),
            });
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        let new_ids: HashSet<&str> = documents
            .iter()
            .map(|doc| doc.id.as_str())
            .filter(|id| !self.by_id.contains_key(*id))
            .collect();
        let requested = self.entries.len() + new_ids.len();
        if requested > self.capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: self.capacity,
                requested,
            });
        }

        Ok(())
    }

    /// Insert or replace a batch of documents with their vectors.
    ///
    /// The whole batch is validated before anything changes: on error the index is
    /// exactly as it was. Ids already present are replaced in place and do not count
    /// against capacity. If an id appears twice in the batch, the later one wins.
    pub fn add_vectors(
        &mut self,
        vectors: Vec<Vec<f16>>,
        documents: Vec<Document>,
    ) -> Result<(), IndexError> {
        self.validate_batch(&vectors, &documents)?;

        for (vector, document) in vectors.into_iter().zip(documents) {
            let norm = vector_norm(&vector);
            match self.by_id.get(&document.id) {
                Some(seq) => {
                    if let Some(entry) = self.entries.get_mut(seq) {
                        entry.content = document.content;
                        entry.vector = vector;
                        entry.norm = norm;
                    }
                }
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.by_id.insert(document.id.clone(), seq);
                    self.entries.insert(
                        seq,
                        IndexEntry {
                            id: document.id,
                            content: document.content,
                            vector,
                            norm,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Remove `id`, returning whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.by_id.remove(id) {
            Some(seq) => self.entries.remove(&seq).is_some(),
            None => false,
        }
    }

    /// Return at most `k` documents most similar to `query`, best first.
    ///
    /// Equal scores keep insertion order. With `min_score`, matches scoring below the
    /// threshold are dropped after ranking.
    pub fn search(
        &self,
        query: &[f16],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = vector_norm(query);
        let ranked = self
            .entries
            .iter()
            .map(|(seq, entry)| (*seq, entry, cosine(query, query_norm, &entry.vector, entry.norm)))
            .k_smallest_by(k, |a, b| {
                b.2.partial_cmp(&a.2)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });

        Ok(ranked
            .filter(|(_, _, score)| min_score.is_none_or(|min| *score >= min))
            .map(|(_, entry, score)| SearchHit {
                id: entry.id.clone(),
                content: entry.content.clone(),
                score,
            })
            .collect())
    }
}

fn vector_norm(v: &[f16]) -> f32 {
    v.iter()
        .map(|x| {
            let x = x.to_f32();
            x * x
        })
        .sum::<f32>()
        .sqrt()
}

/// Cosine similarity with precomputed norms. Zero vectors score 0.
fn cosine(a: &[f16], norm_a: f32, b: &[f16], norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum();
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> Vec<f16> {
        values.iter().copied().map(f16::from_f32).collect()
    }

    fn doc(id: &str) -> Document {
        Document::new(id, format!("content of {id}"))
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_cosine() {
        let a = v(&[1.0, 0.0]);
        let b = v(&[0.0, 1.0]);
        let c = v(&[-1.0, 0.0]);
        let d = v(&[0.6, 0.8]);
        assert_eq!(cosine(&a, vector_norm(&a), &a, vector_norm(&a)), 1.0);
        assert_eq!(cosine(&a, vector_norm(&a), &b, vector_norm(&b)), 0.0);
        assert_eq!(cosine(&a, vector_norm(&a), &c, vector_norm(&c)), -1.0);
        assert!((cosine(&a, vector_norm(&a), &d, vector_norm(&d)) - 0.6).abs() < 1e-3);

        let zero = v(&[0.0, 0.0]);
        assert_eq!(cosine(&zero, 0.0, &a, vector_norm(&a)), 0.0);
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let mut index = SimilarityIndex::new(2, 10);
        index
            .add_vectors(
                vec![v(&[0.0, 1.0]), v(&[1.0, 0.0]), v(&[0.7, 0.7])],
                vec![doc("far"), doc("exact"), doc("near")],
            )
            .unwrap();

        let hits = index.search(&v(&[1.0, 0.0]), 2, None).unwrap();
        assert_eq!(ids(&hits), vec!["exact", "near"]);
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].content, "content of exact");

        let all = index.search(&v(&[1.0, 0.0]), 10, None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut index = SimilarityIndex::new(2, 10);
        index
            .add_vectors(
                vec![v(&[1.0, 0.0]), v(&[1.0, 0.0]), v(&[1.0, 0.0])],
                vec![doc("first"), doc("second"), doc("third")],
            )
            .unwrap();

        let hits = index.search(&v(&[1.0, 0.0]), 3, None).unwrap();
        assert_eq!(ids(&hits), vec!["first", "second", "third"]);

        // Updating keeps the original slot
        index
            .add_vectors(vec![v(&[1.0, 0.0])], vec![Document::new("first", "edited")])
            .unwrap();
        let hits = index.search(&v(&[1.0, 0.0]), 3, None).unwrap();
        assert_eq!(ids(&hits), vec!["first", "second", "third"]);
        assert_eq!(hits[0].content, "edited");
    }

    #[test]
    fn test_update_replaces_instead_of_duplicating() {
        let mut index = SimilarityIndex::new(2, 10);
        index.add_vectors(vec![v(&[1.0, 0.0])], vec![doc("a")]).unwrap();
        index
            .add_vectors(vec![v(&[0.0, 1.0])], vec![Document::new("a", "moved")])
            .unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&v(&[0.0, 1.0]), 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "moved");
        assert!((hits[0].score - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_capacity_is_enforced_atomically() {
        let mut index = SimilarityIndex::new(1, 2);
        index
            .add_vectors(vec![v(&[1.0]), v(&[1.0])], vec![doc("a"), doc("b")])
            .unwrap();

        let err = index
            .add_vectors(vec![v(&[1.0]), v(&[1.0])], vec![doc("a"), doc("c")])
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::CapacityExceeded {
                capacity: 2,
                requested: 3
            }
        );
        // Nothing from the rejected batch landed, including the update to "a"
        assert_eq!(index.len(), 2);
        assert_eq!(index.content("a"), Some("content of a"));

        // Replacing existing ids never needs capacity
        index
            .add_vectors(vec![v(&[1.0])], vec![Document::new("b", "new b")])
            .unwrap();
        assert_eq!(index.content("b"), Some("new b"));
    }

    #[test]
    fn test_dimension_and_batch_validation() {
        let mut index = SimilarityIndex::new(3, 10);
        let err = index
            .add_vectors(vec![v(&[1.0, 0.0, 0.0]), v(&[1.0])], vec![doc("a"), doc("b")])
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        );
        assert!(index.is_empty());

        let err = index.add_vectors(vec![v(&[1.0, 0.0, 0.0])], vec![]).unwrap_err();
        assert!(matches!(err, IndexError::BatchMismatch { .. }));

        assert!(index.search(&v(&[1.0]), 1, None).is_err());
    }

    #[test]
    fn test_duplicate_id_within_batch_last_wins() {
        let mut index = SimilarityIndex::new(1, 1);
        index
            .add_vectors(
                vec![v(&[1.0]), v(&[1.0])],
                vec![Document::new("a", "first"), Document::new("a", "second")],
            )
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.content("a"), Some("second"));
    }

    #[test]
    fn test_remove_and_empty_search() {
        let mut index = SimilarityIndex::new(2, 10);
        assert!(index.search(&v(&[1.0, 0.0]), 3, None).unwrap().is_empty());

        index.add_vectors(vec![v(&[1.0, 0.0])], vec![doc("a")]).unwrap();
        assert!(index.contains("a"));
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert!(index.search(&v(&[1.0, 0.0]), 3, None).unwrap().is_empty());
        assert!(index.search(&v(&[1.0, 0.0]), 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_min_score_threshold() {
        let mut index = SimilarityIndex::new(2, 10);
        index
            .add_vectors(
                vec![v(&[1.0, 0.0]), v(&[0.0, 1.0])],
                vec![doc("match"), doc("orthogonal")],
            )
            .unwrap();

        let hits = index.search(&v(&[1.0, 0.0]), 10, Some(0.5)).unwrap();
        assert_eq!(ids(&hits), vec!["match"]);
    }
}
