//! Exact cosine search over an in-memory set of unit vectors.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::SearchHit;
use crate::inference::l2_normalize;

/// One class's vectors, keyed by entity id. Vectors are stored normalized,
/// so cosine similarity is a dot product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatIndex {
    dim: Option<usize>,
    entries: BTreeMap<i64, Vec<f32>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(dim: Option<usize>, entries: BTreeMap<i64, Vec<f32>>) -> Self {
        Self { dim, entries }
    }

    /// Fixed by the first insert, or by the file the index was loaded from
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, id: i64) -> Option<&[f32]> {
        self.entries.get(&id).map(|v| v.as_slice())
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&i64, &Vec<f32>)> {
        self.entries.iter()
    }

    /// Add or replace `id`. Returns the expected dimension on mismatch.
    pub fn insert(&mut self, id: i64, mut vector: Vec<f32>) -> Result<(), usize> {
        match self.dim {
            Some(dim) if dim != vector.len() => return Err(dim),
            Some(_) => {}
            None => self.dim = Some(vector.len()),
        }
        l2_normalize(&mut vector);
        self.entries.insert(id, vector);
        Ok(())
    }

    pub fn remove(&mut self, id: i64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Clear everything, including the dimension
    pub fn reset(&mut self) {
        self.dim = None;
        self.entries.clear();
    }

    /// Top `k` by cosine similarity, ties broken by ascending id
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || self.dim != Some(query.len()) {
            return Vec::new();
        }

        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|(&id, vector)| SearchHit {
                id,
                score: dot(&query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        hits
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
