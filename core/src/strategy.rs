//! Cell-ranking strategies.
//!
//! Every strategy is one variant of `Strategy`; `Ranker` owns the dispatch
//! and returns a best-first `Vec<(CellId, score)>` regardless of whether a
//! strategy's native score is higher-better (baselines, naive Bayes, ACP)
//! or lower-better (KL, cosine distance). Ties always break toward the
//! smaller cell id so rankings are deterministic.
//!
//! The ranker borrows the grid, document table, vocabulary, and background
//! model from the driver; the only mutable state it carries is the seeded
//! generator for the random baselines, the posterior cache, and the memoized
//! popularity ranking (query-independent, so computed once).

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::warn;

use crate::corpus::DocumentTable;
use crate::grid::{CellId, Grid};
use crate::posterior::{rank_by_acp, PosteriorCache};
use crate::unigram::{GlobalUnigram, SmoothedUnigram};
use crate::vocab::{Vocab, WordId};

/// Allowed round-off above 1.0 for the cosine distance; anything beyond is
/// a kernel bug, asserted in debug builds and clipped in release.
pub const COSINE_TOLERANCE: f64 = 0.002;

/// Query-independent baseline flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineKind {
    /// Cells by summed incoming links, descending.
    InternalLink,
    /// Cells by number of member documents, descending.
    NumArticles,
    /// Uniform shuffle of the populated cells.
    Random,
    /// Rank the most-common-toponym's article cells by link count, then the
    /// remaining cells shuffled.
    LinkMostCommonToponym,
    /// Rank by the most-common-toponym's per-word cell posterior.
    CellDistMostCommonToponym,
}

impl BaselineKind {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "internal-link" => BaselineKind::InternalLink,
            "num-articles" => BaselineKind::NumArticles,
            "random" => BaselineKind::Random,
            "link-most-common-toponym" => BaselineKind::LinkMostCommonToponym,
            "regdist-most-common-toponym" => BaselineKind::CellDistMostCommonToponym,
            other => bail!("unknown baseline '{}'", other),
        })
    }

    /// Whether this baseline picks a toponym out of the document (and so
    /// needs case preserved at ingestion).
    pub fn needs_case(&self) -> bool {
        matches!(
            self,
            BaselineKind::LinkMostCommonToponym | BaselineKind::CellDistMostCommonToponym
        )
    }
}

/// Naive-Bayes term weighting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NbWeighting {
    /// Word term and prior both weigh 1.
    Equal,
    /// Prior weighs `baseline_weight`, the word term splits the rest over
    /// the document length.
    EqualWords { baseline_weight: f64 },
}

/// One ranking strategy, dispatched by `Ranker::rank`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Baseline(BaselineKind),
    Kl { partial: bool, symmetric: bool },
    Cosine { smoothed: bool, partial: bool },
    NaiveBayes { use_prior: bool, weighting: NbWeighting },
    Acp,
}

impl Strategy {
    /// Parse the configuration surface. Returns `None` for "none" (grid
    /// build only, no evaluation). `baseline` is consulted only when the
    /// strategy is "baseline".
    pub fn parse(strategy: &str, baseline: &str, nb_weighting: NbWeighting) -> Result<Option<Self>> {
        Ok(Some(match strategy {
            "none" => return Ok(None),
            "baseline" => Strategy::Baseline(BaselineKind::parse(baseline)?),
            "partial-kl" => Strategy::Kl { partial: true, symmetric: false },
            "full-kl" => Strategy::Kl { partial: false, symmetric: false },
            "sym-partial-kl" => Strategy::Kl { partial: true, symmetric: true },
            "sym-full-kl" => Strategy::Kl { partial: false, symmetric: true },
            "cosine" => Strategy::Cosine { smoothed: false, partial: false },
            "partial-cosine" => Strategy::Cosine { smoothed: false, partial: true },
            "smoothed-cosine" => Strategy::Cosine { smoothed: true, partial: false },
            "smoothed-partial-cosine" => Strategy::Cosine { smoothed: true, partial: true },
            "acp" => Strategy::Acp,
            "nb-with-baseline" => Strategy::NaiveBayes { use_prior: true, weighting: nb_weighting },
            "nb-no-baseline" => Strategy::NaiveBayes { use_prior: false, weighting: nb_weighting },
            other => bail!("unknown strategy '{}'", other),
        }))
    }

    pub fn needs_case(&self) -> bool {
        matches!(self, Strategy::Baseline(kind) if kind.needs_case())
    }
}

/// Strategy dispatcher bound to one built model.
pub struct Ranker<'a> {
    strategy: Strategy,
    grid: &'a Grid,
    docs: &'a DocumentTable,
    vocab: &'a Vocab,
    bg: &'a GlobalUnigram,
    rng: RefCell<StdRng>,
    cache: RefCell<PosteriorCache>,
    popularity: RefCell<Option<Arc<Vec<(CellId, f64)>>>>,
}

impl<'a> Ranker<'a> {
    pub fn new(
        strategy: Strategy,
        grid: &'a Grid,
        docs: &'a DocumentTable,
        vocab: &'a Vocab,
        bg: &'a GlobalUnigram,
        lru_capacity: usize,
        seed: u64,
    ) -> Self {
        Self {
            strategy,
            grid,
            docs,
            vocab,
            bg,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            cache: RefCell::new(PosteriorCache::new(lru_capacity)),
            popularity: RefCell::new(None),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Posterior-cache (hits, misses).
    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache.borrow().stats()
    }

    /// Rank all candidate cells for one finished document model,
    /// best-first.
    pub fn rank(&self, doc: &SmoothedUnigram) -> Vec<(CellId, f64)> {
        match self.strategy {
            Strategy::Baseline(kind) => self.rank_baseline(kind, doc),
            Strategy::Kl { partial, symmetric } => {
                let mut out: Vec<(CellId, f64)> = self
                    .grid
                    .iter_nonempty(true)
                    .map(|cell| {
                        let d = if symmetric {
                            doc.symmetric_kl(&cell.model, self.bg, partial)
                        } else {
                            doc.fast_kl(&cell.model, self.bg, partial)
                        };
                        (cell.id, d)
                    })
                    .collect();
                sort_ascending(&mut out);
                out
            }
            Strategy::Cosine { smoothed, partial } => {
                let mut out: Vec<(CellId, f64)> = self
                    .grid
                    .iter_nonempty(true)
                    .map(|cell| {
                        let sim = doc.fast_cosine(&cell.model, self.bg, partial, smoothed);
                        let score = 1.0 - sim;
                        debug_assert!(
                            (-COSINE_TOLERANCE..=1.0 + COSINE_TOLERANCE).contains(&score),
                            "cosine distance {} beyond tolerance",
                            score
                        );
                        (cell.id, score.clamp(0.0, 1.0))
                    })
                    .collect();
                sort_ascending(&mut out);
                out
            }
            Strategy::NaiveBayes { use_prior, weighting } => self.rank_naive_bayes(doc, use_prior, weighting),
            Strategy::Acp => rank_by_acp(doc, self.grid, self.bg, &mut self.cache.borrow_mut()),
        }
    }

    fn rank_naive_bayes(
        &self,
        doc: &SmoothedUnigram,
        use_prior: bool,
        weighting: NbWeighting,
    ) -> Vec<(CellId, f64)> {
        let doc_tokens = doc.total_tokens() as f64;
        let (word_weight, prior_weight) = match weighting {
            NbWeighting::Equal => (1.0, 1.0),
            NbWeighting::EqualWords { baseline_weight } => {
                let w = if doc_tokens > 0.0 {
                    (1.0 - baseline_weight) / doc_tokens
                } else {
                    0.0
                };
                (w, baseline_weight)
            }
        };
        let total_links_docs = self.grid.total_docs_for_links() as f64;

        let mut out: Vec<(CellId, f64)> = self
            .grid
            .iter_nonempty(true)
            .map(|cell| {
                let mut word_term = 0.0;
                for (w, count) in doc.iter_counts() {
                    let p = cell.model.prob(w, self.bg);
                    if p <= 0.0 {
                        warn!(word = w, cell = cell.id, "zero probability under a log; word skipped");
                        continue;
                    }
                    word_term += count as f64 * p.ln();
                }
                let mut score = word_weight * word_term;
                if use_prior && total_links_docs > 0.0 {
                    let prior = cell.num_docs_links as f64 / total_links_docs;
                    score += prior_weight * prior.ln();
                }
                (cell.id, score)
            })
            .collect();
        sort_descending(&mut out);
        out
    }

    fn rank_baseline(&self, kind: BaselineKind, doc: &SmoothedUnigram) -> Vec<(CellId, f64)> {
        match kind {
            BaselineKind::Random => {
                let mut ids: Vec<CellId> = self.grid.iter_nonempty(false).map(|c| c.id).collect();
                ids.shuffle(&mut *self.rng.borrow_mut());
                ids.into_iter().map(|id| (id, 0.0)).collect()
            }
            BaselineKind::InternalLink | BaselineKind::NumArticles => {
                if let Some(cached) = self.popularity.borrow().as_ref() {
                    return (**cached).clone();
                }
                let mut out: Vec<(CellId, f64)> = self
                    .grid
                    .iter_nonempty(false)
                    .map(|cell| {
                        let score = match kind {
                            BaselineKind::InternalLink => cell.incoming_links_sum as f64,
                            _ => cell.num_docs_links as f64,
                        };
                        (cell.id, score)
                    })
                    .collect();
                sort_descending(&mut out);
                *self.popularity.borrow_mut() = Some(Arc::new(out.clone()));
                out
            }
            BaselineKind::LinkMostCommonToponym => {
                let Some(word) = self.most_common_toponym(doc) else {
                    return Vec::new();
                };
                let mut out: Vec<(CellId, f64)> = Vec::new();
                if let Some(idx) = self.docs.doc_by_title(self.vocab.unmemoize(word)) {
                    let meta = self.docs.doc(idx);
                    if let Some(coord) = meta.coord {
                        if let Some(cell) = self.grid.cell_for_coord(coord) {
                            out.push((cell, meta.incoming_links.unwrap_or(0) as f64));
                        }
                    }
                }
                let mut rest: Vec<CellId> = self
                    .grid
                    .iter_nonempty(false)
                    .map(|c| c.id)
                    .filter(|id| !out.iter().any(|(c, _)| c == id))
                    .collect();
                rest.shuffle(&mut *self.rng.borrow_mut());
                out.extend(rest.into_iter().map(|id| (id, 0.0)));
                out
            }
            BaselineKind::CellDistMostCommonToponym => {
                let Some(word) = self.most_common_toponym(doc) else {
                    return Vec::new();
                };
                self.cache
                    .borrow_mut()
                    .get_or_compute(word, self.grid, self.bg)
                    .ranked_cells()
            }
        }
    }

    /// Most frequent word passing capitalization + gazetteer membership,
    /// falling back to capitalization alone, then to any word at all.
    fn most_common_toponym(&self, doc: &SmoothedUnigram) -> Option<WordId> {
        let capitalized = |w: WordId| {
            self.vocab
                .unmemoize(w)
                .chars()
                .next()
                .is_some_and(|c| c.is_uppercase())
        };
        let titled = |w: WordId| self.docs.doc_by_title(self.vocab.unmemoize(w)).is_some();

        doc.find_most_common(|w| capitalized(w) && titled(w))
            .or_else(|| doc.find_most_common(capitalized))
            .or_else(|| doc.find_most_common(|_| true))
    }
}

fn sort_ascending(out: &mut [(CellId, f64)]) {
    out.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

fn sort_descending(out: &mut [(CellId, f64)]) {
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Coord;
    use crate::corpus::{DocumentMeta, DocumentTable, Split};
    use crate::grid::{GridBuilder, GridParams};

    struct Fixture {
        grid: Grid,
        docs: DocumentTable,
        vocab: Vocab,
        bg: GlobalUnigram,
    }

    /// Two single-tile cells: "Boston" around (42, -71), "Austin" around
    /// (30, -97), with distinct vocabularies and one shared word.
    fn fixture() -> Fixture {
        let mut vocab = Vocab::new();
        let mut bg = GlobalUnigram::new();
        let mut docs = DocumentTable::new();

        let corpus = [
            ("Boston", 42.4, -71.1, 30u64, vec![("harbor", 4u32), ("tea", 2), ("city", 1), ("Boston", 2)]),
            ("Austin", 30.3, -97.7, 10, vec![("rodeo", 5), ("music", 2), ("city", 1)]),
        ];
        let mut builder = GridBuilder::new(GridParams::new(1.0, 1).unwrap());
        for (title, lat, lon, links, words) in corpus {
            let idx = docs.push_doc(DocumentMeta {
                id: title.to_owned(),
                title: title.to_owned(),
                split: Split::Training,
                coord: Some(Coord::new(lat, lon).unwrap()),
                incoming_links: Some(links),
            });
            let mut model = SmoothedUnigram::new();
            for (word, count) in words {
                let w = vocab.memoize(word);
                bg.add(w, count as u64);
                model.add_count(w, count);
            }
            model.finish(1, &bg);
            docs.set_model(idx, model);
            builder.add_document(idx, docs.doc(idx).coord.unwrap());
        }

        let grid = builder.build(&docs, &bg, 1, true);
        Fixture { grid, docs, vocab, bg }
    }

    fn ranker<'a>(f: &'a Fixture, strategy: Strategy) -> Ranker<'a> {
        Ranker::new(strategy, &f.grid, &f.docs, &f.vocab, &f.bg, 64, 7)
    }

    fn test_doc(f: &Fixture, words: &[(&str, u32)]) -> SmoothedUnigram {
        let mut m = SmoothedUnigram::new();
        for &(word, count) in words {
            m.add_count(f.vocab.try_memoize(word).unwrap(), count);
        }
        m.finish(1, &f.bg);
        m
    }

    fn boston_cell(f: &Fixture) -> CellId {
        f.grid
            .cell_for_coord(Coord::new(42.4, -71.1).unwrap())
            .unwrap()
    }

    #[test]
    fn kl_prefers_the_matching_cell() {
        let f = fixture();
        let doc = test_doc(&f, &[("harbor", 3), ("tea", 1)]);
        for (partial, symmetric) in [(true, false), (false, false), (true, true), (false, true)] {
            let r = ranker(&f, Strategy::Kl { partial, symmetric });
            let ranked = r.rank(&doc);
            assert_eq!(ranked.len(), 2);
            assert_eq!(ranked[0].0, boston_cell(&f), "partial={} symmetric={}", partial, symmetric);
            assert!(ranked[0].1 <= ranked[1].1, "smaller divergence first");
        }
    }

    #[test]
    fn cosine_scores_stay_in_unit_range() {
        let f = fixture();
        let doc = test_doc(&f, &[("harbor", 4), ("tea", 2), ("city", 1)]);
        for (smoothed, partial) in [(false, false), (false, true), (true, false), (true, true)] {
            let r = ranker(&f, Strategy::Cosine { smoothed, partial });
            let ranked = r.rank(&doc);
            assert_eq!(ranked[0].0, boston_cell(&f));
            for (_, score) in ranked {
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }

    #[test]
    fn naive_bayes_is_higher_better_and_prefers_matching_cell() {
        let f = fixture();
        let doc = test_doc(&f, &[("rodeo", 2), ("music", 1)]);
        for weighting in [NbWeighting::Equal, NbWeighting::EqualWords { baseline_weight: 0.5 }] {
            for use_prior in [true, false] {
                let r = ranker(&f, Strategy::NaiveBayes { use_prior, weighting });
                let ranked = r.rank(&doc);
                assert!(ranked[0].1 >= ranked[1].1);
                assert_ne!(ranked[0].0, boston_cell(&f));
            }
        }
    }

    #[test]
    fn random_baseline_is_reproducible_under_a_fixed_seed() {
        let f = fixture();
        let doc = test_doc(&f, &[("city", 1)]);
        let a = ranker(&f, Strategy::Baseline(BaselineKind::Random)).rank(&doc);
        let b = ranker(&f, Strategy::Baseline(BaselineKind::Random)).rank(&doc);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn popularity_baselines_rank_by_links_and_memoize() {
        let f = fixture();
        let doc = test_doc(&f, &[("city", 1)]);
        let r = ranker(&f, Strategy::Baseline(BaselineKind::InternalLink));
        let first = r.rank(&doc);
        assert_eq!(first[0].0, boston_cell(&f), "30 links beats 10");
        let again = r.rank(&doc);
        assert_eq!(first, again);
    }

    #[test]
    fn toponym_baseline_uses_title_match() {
        let f = fixture();
        // "Boston" is both a document word and an article title, so the
        // first predicate (capitalized + gazetteer) selects it.
        let doc = test_doc(&f, &[("Boston", 2), ("city", 1)]);
        let r = ranker(&f, Strategy::Baseline(BaselineKind::LinkMostCommonToponym));
        let ranked = r.rank(&doc);
        assert_eq!(ranked[0].0, boston_cell(&f));
        assert_eq!(ranked.len(), 2, "remaining cells are appended");
    }

    #[test]
    fn toponym_baseline_falls_back_to_any_word() {
        let f = fixture();
        let doc = test_doc(&f, &[("harbor", 2), ("city", 1)]);
        for kind in [BaselineKind::LinkMostCommonToponym, BaselineKind::CellDistMostCommonToponym] {
            let r = ranker(&f, Strategy::Baseline(kind));
            let ranked = r.rank(&doc);
            assert!(!ranked.is_empty(), "all-lowercase doc must still rank: {:?}", kind);
        }
    }

    #[test]
    fn acp_returns_normalized_best_first_ranking() {
        let f = fixture();
        let doc = test_doc(&f, &[("harbor", 2)]);
        let r = ranker(&f, Strategy::Acp);
        let ranked = r.rank(&doc);
        assert_eq!(ranked[0].0, boston_cell(&f));
        let sum: f64 = ranked.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // Second identical query hits the cache.
        let _ = r.rank(&doc);
        let (hits, misses) = r.cache_stats();
        assert_eq!((hits, misses), (1, 1));
    }

    #[test]
    fn strategy_names_parse_to_variants() {
        let eq = NbWeighting::Equal;
        assert_eq!(Strategy::parse("none", "", eq).unwrap(), None);
        assert_eq!(
            Strategy::parse("partial-kl", "", eq).unwrap(),
            Some(Strategy::Kl { partial: true, symmetric: false })
        );
        assert_eq!(
            Strategy::parse("smoothed-partial-cosine", "", eq).unwrap(),
            Some(Strategy::Cosine { smoothed: true, partial: true })
        );
        assert_eq!(
            Strategy::parse("baseline", "random", eq).unwrap(),
            Some(Strategy::Baseline(BaselineKind::Random))
        );
        assert!(Strategy::parse("kl", "", eq).is_err());
        assert!(Strategy::parse("baseline", "bogus", eq).is_err());
    }
}
