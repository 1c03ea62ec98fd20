//! Per-word cell posteriors and their LRU cache.
//!
//! For a word w the posterior is `p(c | w) ∝ cell.model.p(w)` over every
//! populated cell with a non-empty model. When the normalizer is zero (a
//! globally unknown word) the posterior is kept as-is and marked
//! unnormalized; callers must test the flag and back off.
//!
//! Computing a posterior touches every cell, so it dominates ACP inference;
//! the cache is a classic least-recently-used map from word id to posterior
//! with hit/miss instrumentation.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::grid::{CellId, Grid};
use crate::unigram::{GlobalUnigram, SmoothedUnigram};
use crate::vocab::WordId;

/// Probability distribution over cells for one word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellPosterior {
    /// (cell, probability) for every cell with positive mass.
    probs: Vec<(CellId, f64)>,
    /// False when the normalizer was zero and the entries are raw.
    pub normalized: bool,
}

impl CellPosterior {
    /// Compute the posterior for `word` over the grid's non-empty cells.
    pub fn compute(word: WordId, grid: &Grid, bg: &GlobalUnigram) -> Self {
        let mut probs: Vec<(CellId, f64)> = Vec::new();
        let mut z = 0.0;
        for cell in grid.iter_nonempty(true) {
            let p = cell.model.prob(word, bg);
            if p > 0.0 {
                probs.push((cell.id, p));
                z += p;
            }
        }

        let normalized = z > 0.0;
        if normalized {
            for (_, p) in probs.iter_mut() {
                *p /= z;
            }
        }
        Self { probs, normalized }
    }

    /// Cells ranked by probability descending, ties by cell id ascending.
    pub fn ranked_cells(&self) -> Vec<(CellId, f64)> {
        let mut out = self.probs.clone();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }

    /// Raw (cell, probability) entries, unordered.
    pub fn iter(&self) -> impl Iterator<Item = (CellId, f64)> + '_ {
        self.probs.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }
}

/// LRU cache over per-word posteriors.
///
/// A hit promotes the key to most-recent; a miss computes, inserts, and
/// evicts the least-recent entry once the capacity is reached.
#[derive(Debug)]
pub struct PosteriorCache {
    cache: LruCache<WordId, Arc<CellPosterior>>,
    hits: usize,
    misses: usize,
}

impl PosteriorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached posterior for `word`, computing it on a miss.
    pub fn get_or_compute(
        &mut self,
        word: WordId,
        grid: &Grid,
        bg: &GlobalUnigram,
    ) -> Arc<CellPosterior> {
        if let Some(hit) = self.cache.get(&word) {
            self.hits += 1;
            return Arc::clone(hit);
        }
        self.misses += 1;
        let posterior = Arc::new(CellPosterior::compute(word, grid, bg));
        if !posterior.normalized {
            debug!(word, "posterior left unnormalized (zero mass)");
        }
        self.cache.put(word, Arc::clone(&posterior));
        posterior
    }

    /// True when the word is resident, without touching recency.
    pub fn contains(&self, word: WordId) -> bool {
        self.cache.contains(&word)
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    /// Hit rate in percent; `None` before the first access.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64 * 100.0)
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
        self.misses = 0;
    }
}

/// Rank cells for a whole document by average cell probability:
/// `p(c | doc) ∝ Σ_w m(w) · p(c | w)`, normalized over all touched cells.
pub fn rank_by_acp(
    doc: &SmoothedUnigram,
    grid: &Grid,
    bg: &GlobalUnigram,
    cache: &mut PosteriorCache,
) -> Vec<(CellId, f64)> {
    let mut scores: ahash::AHashMap<CellId, f64> = ahash::AHashMap::new();
    let mut total = 0.0;
    for (word, count) in doc.iter_counts() {
        let posterior = cache.get_or_compute(word, grid, bg);
        if !posterior.normalized {
            continue;
        }
        for (cell, p) in posterior.iter() {
            let weighted = count as f64 * p;
            *scores.entry(cell).or_insert(0.0) += weighted;
            total += weighted;
        }
    }

    let mut out: Vec<(CellId, f64)> = scores.into_iter().collect();
    if total > 0.0 {
        for (_, s) in out.iter_mut() {
            *s /= total;
        }
    }
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}
