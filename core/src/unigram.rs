//! Smoothed unigram word distributions.
//!
//! Two models live here:
//!
//! - `GlobalUnigram` — the process-wide background distribution built from
//!   all training counts, read-only once frozen. It supplies `p_global(w)`
//!   used to redistribute unseen-word mass.
//! - `SmoothedUnigram` — the sparse per-document / per-cell distribution.
//!   `finish()` reserves a Good-Turing-style unseen mass (the mass of
//!   singletons) and caches the background mass not covered by the seen set;
//!   after that the model is immutable and serves probability lookups plus
//!   the fast KL and cosine kernels used by the ranking strategies.
//!
//! All probability accumulation is in f64. Queries on an unfinished model
//! panic: that is a contract bug in the caller, never a runtime condition.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vocab::WordId;

/// Clipping bound for the reserved unseen mass: it always stays inside
/// [UNSEEN_MASS_FLOOR, 1 - UNSEEN_MASS_FLOOR] for a model with tokens.
const UNSEEN_MASS_FLOOR: f64 = 1e-9;

/// Fallback when a model has observed every word the background knows and
/// the uncovered background mass would otherwise be zero.
const DEGENERATE_UNSEEN_EPSILON: f64 = 1e-12;

/// Background unigram distribution over the whole training corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalUnigram {
    counts: AHashMap<WordId, u64>,
    total: u64,
}

impl GlobalUnigram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a training count.
    pub fn add(&mut self, word: WordId, count: u64) {
        *self.counts.entry(word).or_insert(0) += count;
        self.total += count;
    }

    /// `p_global(w)`; zero for words never seen in training.
    pub fn prob(&self, word: WordId) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        match self.counts.get(&word) {
            Some(&c) => c as f64 / self.total as f64,
            None => 0.0,
        }
    }

    pub fn contains(&self, word: WordId) -> bool {
        self.counts.contains_key(&word)
    }

    pub fn total_tokens(&self) -> u64 {
        self.total
    }

    pub fn num_types(&self) -> usize {
        self.counts.len()
    }
}

/// Sparse unigram distribution with reserved unseen mass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmoothedUnigram {
    counts: AHashMap<WordId, u32>,
    total_tokens: u64,
    unseen_mass: f64,
    overall_unseen_mass: f64,
    finished: bool,
}

impl SmoothedUnigram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a raw count for one word.
    pub fn add_count(&mut self, word: WordId, count: u32) {
        assert!(!self.finished, "add_count on a finished model");
        *self.counts.entry(word).or_insert(0) += count;
        self.total_tokens += count as u64;
    }

    /// Fold another model's counts into this one (cell aggregation).
    pub fn add_model(&mut self, other: &SmoothedUnigram) {
        assert!(!self.finished, "add_model on a finished model");
        for (&w, &c) in &other.counts {
            *self.counts.entry(w).or_insert(0) += c;
            self.total_tokens += c as u64;
        }
    }

    /// Freeze the model.
    ///
    /// Drops words below `min_count`, computes the reserved unseen mass from
    /// the singleton fraction (1.0 for a model with no tokens at all), and
    /// caches the background mass left uncovered by the seen set.
    pub fn finish(&mut self, min_count: u32, bg: &GlobalUnigram) {
        assert!(!self.finished, "finish called twice");

        if min_count > 1 {
            let mut dropped: u64 = 0;
            self.counts.retain(|_, c| {
                if *c < min_count {
                    dropped += *c as u64;
                    false
                } else {
                    true
                }
            });
            self.total_tokens -= dropped;
        }

        if self.total_tokens == 0 {
            self.unseen_mass = 1.0;
        } else {
            let singletons = self.counts.values().filter(|&&c| c == 1).count();
            let raw = singletons as f64 / self.total_tokens as f64;
            self.unseen_mass = raw.clamp(UNSEEN_MASS_FLOOR, 1.0 - UNSEEN_MASS_FLOOR);
        }

        let seen_global_mass: f64 = self.counts.keys().map(|&w| bg.prob(w)).sum();
        let mut overall = 1.0 - seen_global_mass;
        if overall <= 0.0 {
            // The model has observed (essentially) the entire background
            // vocabulary; keep the denominator usable.
            warn!(
                uncovered = overall,
                "background mass fully covered by seen set; using epsilon"
            );
            overall = DEGENERATE_UNSEEN_EPSILON;
        }
        self.overall_unseen_mass = overall;
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Number of distinct observed words.
    pub fn num_types(&self) -> usize {
        self.counts.len()
    }

    /// Raw observed count for a word (0 when unseen).
    pub fn count(&self, word: WordId) -> u32 {
        self.counts.get(&word).copied().unwrap_or(0)
    }

    pub fn seen(&self, word: WordId) -> bool {
        self.counts.contains_key(&word)
    }

    /// Iterate over the observed (word, count) pairs, unordered.
    pub fn iter_counts(&self) -> impl Iterator<Item = (WordId, u32)> + '_ {
        self.counts.iter().map(|(&w, &c)| (w, c))
    }

    pub fn unseen_mass(&self) -> f64 {
        assert!(self.finished, "unseen_mass on an unfinished model");
        self.unseen_mass
    }

    pub fn overall_unseen_mass(&self) -> f64 {
        assert!(self.finished, "overall_unseen_mass on an unfinished model");
        self.overall_unseen_mass
    }

    /// Smoothed probability of `word`.
    ///
    /// Observed words take their share of `1 - unseen_mass`; unobserved
    /// words split the reserved mass in proportion to the background. The
    /// result is strictly positive whenever this model or the background has
    /// seen the word, and zero only for globally unknown words.
    pub fn prob(&self, word: WordId, bg: &GlobalUnigram) -> f64 {
        assert!(self.finished, "prob on an unfinished model");
        match self.counts.get(&word) {
            Some(&c) => (1.0 - self.unseen_mass) * c as f64 / self.total_tokens as f64,
            None => self.unseen_mass * bg.prob(word) / self.overall_unseen_mass,
        }
    }

    /// Raw (unsmoothed) frequency of `word`; zero when unseen.
    pub fn raw_freq(&self, word: WordId) -> f64 {
        if self.total_tokens == 0 {
            return 0.0;
        }
        self.count(word) as f64 / self.total_tokens as f64
    }

    /// KL divergence KL(self ‖ q).
    ///
    /// The partial form sums `p·ln(p/q)` over this model's seen words only.
    /// The full form adds the words q has seen but self has not, plus a
    /// closed-form term for the words neither has seen, where p/q reduces to
    /// a constant ratio of the two unseen buckets.
    pub fn fast_kl(&self, q: &SmoothedUnigram, bg: &GlobalUnigram, partial: bool) -> f64 {
        assert!(self.finished && q.finished, "fast_kl on an unfinished model");

        let mut kl = 0.0;
        for (&w, &c) in &self.counts {
            let p = (1.0 - self.unseen_mass) * c as f64 / self.total_tokens as f64;
            let qv = q.prob(w, bg);
            if qv <= 0.0 {
                warn!(word = w, "zero probability under a log; contribution skipped");
                continue;
            }
            kl += p * (p / qv).ln();
        }
        if partial {
            return kl;
        }

        // Words seen by q but not by self: p comes from the unseen bucket,
        // q from its observed counts.
        let mut q_only_global_mass = 0.0;
        for (&w, &qc) in &q.counts {
            if self.counts.contains_key(&w) {
                continue;
            }
            let pg = bg.prob(w);
            if pg <= 0.0 {
                continue;
            }
            q_only_global_mass += pg;
            let p = self.unseen_mass * pg / self.overall_unseen_mass;
            let qv = (1.0 - q.unseen_mass) * qc as f64 / q.total_tokens as f64;
            if qv <= 0.0 {
                warn!(word = w, "zero probability under a log; contribution skipped");
                continue;
            }
            kl += p * (p / qv).ln();
        }

        // Words in neither seen set: p/q is the constant ratio of the two
        // unseen buckets, so the whole region contributes its p-mass times
        // one log.
        let uncovered = self.overall_unseen_mass - q_only_global_mass;
        if uncovered > 0.0 && q.unseen_mass > 0.0 {
            let ratio = (self.unseen_mass * q.overall_unseen_mass)
                / (self.overall_unseen_mass * q.unseen_mass);
            if ratio > 0.0 {
                let p_mass = self.unseen_mass * uncovered / self.overall_unseen_mass;
                kl += p_mass * ratio.ln();
            }
        }

        kl
    }

    /// Symmetrized KL: the mean of both directions. Exactly symmetric in
    /// floating point because IEEE addition commutes.
    pub fn symmetric_kl(&self, q: &SmoothedUnigram, bg: &GlobalUnigram, partial: bool) -> f64 {
        (self.fast_kl(q, bg, partial) + q.fast_kl(self, bg, partial)) / 2.0
    }

    /// Cosine similarity between the two distributions.
    ///
    /// The iterated domain is this model's seen set for `partial`, the union
    /// of both seen sets otherwise; norms accumulate over the same domain.
    /// With `smoothed` the smoothed probabilities are compared, otherwise raw
    /// frequencies.
    pub fn fast_cosine(
        &self,
        q: &SmoothedUnigram,
        bg: &GlobalUnigram,
        partial: bool,
        smoothed: bool,
    ) -> f64 {
        assert!(self.finished && q.finished, "fast_cosine on an unfinished model");

        let value = |m: &SmoothedUnigram, w: WordId| -> f64 {
            if smoothed {
                m.prob(w, bg)
            } else {
                m.raw_freq(w)
            }
        };

        let mut dot = 0.0;
        let mut n1 = 0.0;
        let mut n2 = 0.0;
        for (w, _) in self.iter_counts() {
            let pv = value(self, w);
            let qv = value(q, w);
            dot += pv * qv;
            n1 += pv * pv;
            n2 += qv * qv;
        }
        if !partial {
            for (w, _) in q.iter_counts() {
                if self.seen(w) {
                    continue;
                }
                let pv = value(self, w);
                let qv = value(q, w);
                dot += pv * qv;
                n1 += pv * pv;
                n2 += qv * qv;
            }
        }

        if n1 <= 0.0 || n2 <= 0.0 {
            return 0.0;
        }
        dot / (n1.sqrt() * n2.sqrt())
    }

    /// Id of the most frequent observed word satisfying `pred`; ties break
    /// toward the smaller id so the result is deterministic.
    pub fn find_most_common<F: Fn(WordId) -> bool>(&self, pred: F) -> Option<WordId> {
        let mut best: Option<(WordId, u32)> = None;
        for (&w, &c) in &self.counts {
            if !pred(w) {
                continue;
            }
            best = match best {
                None => Some((w, c)),
                Some((bw, bc)) if c > bc || (c == bc && w < bw) => Some((w, c)),
                keep => keep,
            };
        }
        best.map(|(w, _)| w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bg_from(pairs: &[(WordId, u64)]) -> GlobalUnigram {
        let mut bg = GlobalUnigram::new();
        for &(w, c) in pairs {
            bg.add(w, c);
        }
        bg
    }

    fn finished(pairs: &[(WordId, u32)], bg: &GlobalUnigram) -> SmoothedUnigram {
        let mut m = SmoothedUnigram::new();
        for &(w, c) in pairs {
            m.add_count(w, c);
        }
        m.finish(1, bg);
        m
    }

    #[test]
    fn probabilities_sum_to_one_over_union_vocabulary() {
        let bg = bg_from(&[(0, 10), (1, 5), (2, 5), (3, 20)]);
        let m = finished(&[(0, 3), (1, 1)], &bg);
        let sum: f64 = (0..4).map(|w| m.prob(w, &bg)).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum = {}", sum);
    }

    #[test]
    fn seen_and_globally_seen_words_have_positive_probability() {
        let bg = bg_from(&[(0, 4), (1, 6)]);
        let m = finished(&[(0, 2)], &bg);
        assert!(m.prob(0, &bg) > 0.0);
        assert!(m.prob(1, &bg) > 0.0, "globally seen word must smooth > 0");
        assert_eq!(m.prob(99, &bg), 0.0, "globally unknown word is zero");
    }

    #[test]
    fn unseen_mass_is_singleton_fraction() {
        let bg = bg_from(&[(0, 1), (1, 1), (2, 1)]);
        // counts {0:1, 1:1, 2:2} -> 2 singletons / 4 tokens
        let m = finished(&[(0, 1), (1, 1), (2, 2)], &bg);
        assert!((m.unseen_mass() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn empty_model_reserves_all_mass() {
        let bg = bg_from(&[(0, 3)]);
        let mut m = SmoothedUnigram::new();
        m.finish(1, &bg);
        assert_eq!(m.unseen_mass(), 1.0);
        assert!((m.prob(0, &bg) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn min_count_drops_rare_words() {
        let bg = bg_from(&[(0, 5), (1, 5)]);
        let mut m = SmoothedUnigram::new();
        m.add_count(0, 1);
        m.add_count(1, 3);
        m.finish(2, &bg);
        assert!(!m.seen(0));
        assert_eq!(m.total_tokens(), 3);
    }

    #[test]
    fn kl_of_model_with_itself_is_zero() {
        let bg = bg_from(&[(0, 10), (1, 10), (2, 80)]);
        let m = finished(&[(0, 4), (1, 2)], &bg);
        for partial in [true, false] {
            let kl = m.fast_kl(&m, &bg, partial);
            assert!(kl.abs() < 1e-9, "partial={} kl={}", partial, kl);
        }
    }

    #[test]
    fn kl_is_nonnegative_between_different_models() {
        let bg = bg_from(&[(0, 10), (1, 10), (2, 10), (3, 10)]);
        let m1 = finished(&[(0, 5), (1, 1)], &bg);
        let m2 = finished(&[(1, 3), (2, 3)], &bg);
        assert!(m1.fast_kl(&m2, &bg, false) >= 0.0);
        assert!(m2.fast_kl(&m1, &bg, false) >= 0.0);
    }

    #[test]
    fn symmetric_kl_is_exactly_symmetric() {
        let bg = bg_from(&[(0, 7), (1, 3), (2, 5)]);
        let m1 = finished(&[(0, 2), (1, 4)], &bg);
        let m2 = finished(&[(1, 1), (2, 6)], &bg);
        for partial in [true, false] {
            let a = m1.symmetric_kl(&m2, &bg, partial);
            let b = m2.symmetric_kl(&m1, &bg, partial);
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn cosine_of_identical_models_is_one() {
        let bg = bg_from(&[(0, 5), (1, 5)]);
        let m = finished(&[(0, 3), (1, 2)], &bg);
        for (partial, smoothed) in [(true, true), (true, false), (false, true), (false, false)] {
            let c = m.fast_cosine(&m, &bg, partial, smoothed);
            assert!((c - 1.0).abs() < 1e-9, "partial={} smoothed={}", partial, smoothed);
        }
    }

    #[test]
    fn cosine_of_disjoint_unsmoothed_models_is_zero() {
        let bg = bg_from(&[(0, 5), (1, 5)]);
        let m1 = finished(&[(0, 3)], &bg);
        let m2 = finished(&[(1, 2)], &bg);
        let c = m1.fast_cosine(&m2, &bg, false, false);
        assert!(c.abs() < 1e-12);
    }

    #[test]
    fn find_most_common_honors_predicate_and_ties() {
        let bg = bg_from(&[(0, 1), (1, 1), (2, 1)]);
        let m = finished(&[(0, 2), (1, 5), (2, 5)], &bg);
        assert_eq!(m.find_most_common(|_| true), Some(1), "tie breaks to smaller id");
        assert_eq!(m.find_most_common(|w| w == 0), Some(0));
        assert_eq!(m.find_most_common(|w| w > 10), None);
    }

    #[test]
    fn fold_sums_counts_across_documents() {
        let bg = bg_from(&[(0, 2), (1, 2)]);
        let mut d1 = SmoothedUnigram::new();
        d1.add_count(0, 2);
        let mut d2 = SmoothedUnigram::new();
        d2.add_count(0, 1);
        d2.add_count(1, 4);
        let mut cell = SmoothedUnigram::new();
        cell.add_model(&d1);
        cell.add_model(&d2);
        assert_eq!(cell.count(0), 3);
        assert_eq!(cell.count(1), 4);
        assert_eq!(cell.total_tokens(), 7);
    }

    #[test]
    #[should_panic]
    fn querying_an_unfinished_model_panics() {
        let bg = GlobalUnigram::new();
        let m = SmoothedUnigram::new();
        let _ = m.prob(0, &bg);
    }
}
