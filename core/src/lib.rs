//! geolocate-core
//!
//! Document geolocation by language matching: a geodesic grid over Earth,
//! one smoothed unigram model per populated cell, and a family of ranking
//! strategies that place a test document in the cell whose language it most
//! resembles.
//!
//! Public API:
//! - `Coord` - coordinates and great-circle distance
//! - `Vocab` - word ↔ dense id memoizer
//! - `GlobalUnigram` / `SmoothedUnigram` - background and smoothed models
//! - `Grid` / `GridBuilder` - tile addressing and cell aggregation
//! - `DocumentTable` - corpus metadata, counts ingestion, budgets
//! - `PosteriorCache` - per-word cell posteriors under an LRU cache
//! - `Strategy` / `Ranker` - cell ranking
//! - `Evaluator` - the evaluation harness
//! - `Config` / `GeoModel` - configuration and the assembled model

use ahash::AHashSet;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod coord;
pub use coord::{Coord, EARTH_RADIUS_MILES, MILES_PER_DEGREE};

pub mod vocab;
pub use vocab::{Vocab, WordId};

pub mod unigram;
pub use unigram::{GlobalUnigram, SmoothedUnigram};

pub mod grid;
pub use grid::{Cell, CellId, Grid, GridBuilder, GridParams, Tile};

pub mod corpus;
pub use corpus::{
    CountsPolicy, CountsSummary, DocumentMeta, DocumentTable, IngestBudget, IngestFlow,
    RowsSummary, Split, StopReason,
};

pub mod posterior;
pub use posterior::{CellPosterior, PosteriorCache};

pub mod strategy;
pub use strategy::{BaselineKind, NbWeighting, Ranker, Strategy, COSINE_TOLERANCE};

pub mod eval;
pub use eval::{DocOutcome, EvalOpts, EvalReport, Evaluator};

/// Snapshot format version; bumped whenever the serialized layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// Run configuration.
///
/// Strategy and split names stay strings here so the struct round-trips
/// through TOML unchanged; `validate()` parses and cross-checks everything
/// before a run is allowed to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ranking strategy name ("partial-kl", "acp", "baseline", "none", ...).
    pub strategy: String,
    /// Baseline flavor; consulted only when `strategy` is "baseline".
    pub baseline: String,
    /// Tile side length in degrees.
    pub degrees_per_region: f64,
    /// Tile side length in miles; overrides `degrees_per_region` when set.
    pub miles_per_region: Option<f64>,
    /// Cell window side length in tiles.
    pub width_of_stat_region: u32,
    /// Words rarer than this are dropped from document models.
    pub minimum_word_count: u32,
    /// Keep word case instead of lower-casing at ingestion.
    pub preserve_case: bool,
    /// Keep stopwords in document distributions.
    pub include_stopwords_in_doc_dists: bool,
    /// Fold link priors from documents of every split, not only training.
    pub link_prior_all_splits: bool,
    /// Capacity of the per-word posterior cache.
    pub lru_cache_size: usize,
    /// Naive-Bayes weighting: "equal" or "equal-words".
    pub nb_weighting: String,
    /// Prior weight for "equal-words" weighting.
    pub nb_baseline_weight: f64,
    /// Seed for the random baselines.
    pub random_seed: u64,
    /// Split to evaluate: "dev" or "test" (or "training").
    pub eval_split: String,
    pub skip_initial: usize,
    pub every_nth: usize,
    /// Cap on evaluated documents; 0 means all.
    pub num_test_docs: usize,
    pub oracle: bool,
    /// Wall-clock budget per ingestion stage in seconds; 0 means unbounded.
    pub max_time_per_stage_secs: u64,
    /// Cap on training documents loaded; 0 means unbounded.
    pub max_training_docs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: "partial-kl".to_string(),
            baseline: "internal-link".to_string(),
            degrees_per_region: 1.0,
            miles_per_region: None,
            width_of_stat_region: 1,
            minimum_word_count: 1,
            preserve_case: false,
            include_stopwords_in_doc_dists: false,
            link_prior_all_splits: true,
            lru_cache_size: 400,
            nb_weighting: "equal".to_string(),
            nb_baseline_weight: 0.5,
            random_seed: 42,
            eval_split: "dev".to_string(),
            skip_initial: 0,
            every_nth: 1,
            num_test_docs: 0,
            oracle: false,
            max_time_per_stage_secs: 0,
            max_training_docs: 0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("writing config {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Cross-check the whole configuration; every run starts here.
    pub fn validate(&self) -> Result<()> {
        let degrees = self.effective_degrees_per_region();
        if !(degrees > 0.0 && degrees.is_finite()) {
            bail!("grid size must be positive, got {} degrees per region", degrees);
        }
        if self.width_of_stat_region < 1 {
            bail!("width_of_stat_region must be at least 1");
        }
        if self.every_nth < 1 {
            bail!("every_nth must be at least 1");
        }
        if self.lru_cache_size == 0 {
            bail!("lru_cache_size must be positive");
        }
        if !(0.0..=1.0).contains(&self.nb_baseline_weight) {
            bail!("nb_baseline_weight must lie in [0, 1], got {}", self.nb_baseline_weight);
        }
        self.parse_eval_split()?;
        let weighting = self.parse_nb_weighting()?;
        let strategy = Strategy::parse(&self.strategy, &self.baseline, weighting)?;
        if let Some(strategy) = strategy {
            // Toponym baselines read capitalization off the vocabulary;
            // with case folding every capitalization predicate would be
            // false, so the combination is refused outright.
            if strategy.needs_case() && !self.preserve_case {
                bail!("baseline '{}' requires preserve_case", self.baseline);
            }
        }
        Ok(())
    }

    /// Tile size in degrees after the miles override.
    pub fn effective_degrees_per_region(&self) -> f64 {
        match self.miles_per_region {
            Some(miles) => miles / MILES_PER_DEGREE,
            None => self.degrees_per_region,
        }
    }

    pub fn grid_params(&self) -> Result<GridParams> {
        GridParams::new(self.effective_degrees_per_region(), self.width_of_stat_region)
    }

    pub fn parse_nb_weighting(&self) -> Result<NbWeighting> {
        match self.nb_weighting.as_str() {
            "equal" => Ok(NbWeighting::Equal),
            "equal-words" => Ok(NbWeighting::EqualWords {
                baseline_weight: self.nb_baseline_weight,
            }),
            other => bail!("unknown nb_weighting '{}'", other),
        }
    }

    /// The configured strategy; `None` for "none" (build the grid, skip
    /// evaluation).
    pub fn parse_strategy(&self) -> Result<Option<Strategy>> {
        Strategy::parse(&self.strategy, &self.baseline, self.parse_nb_weighting()?)
    }

    pub fn parse_eval_split(&self) -> Result<Split> {
        self.eval_split.parse()
    }

    pub fn eval_opts(&self) -> Result<EvalOpts> {
        Ok(EvalOpts {
            split: self.parse_eval_split()?,
            skip_initial: self.skip_initial,
            every_nth: self.every_nth,
            max_docs: if self.num_test_docs == 0 {
                None
            } else {
                Some(self.num_test_docs)
            },
            oracle: self.oracle,
        })
    }

    pub fn counts_policy(&self, stopwords: AHashSet<String>) -> CountsPolicy {
        CountsPolicy {
            preserve_case: self.preserve_case,
            include_stopwords: self.include_stopwords_in_doc_dists,
            stopwords,
        }
    }

    /// Fresh cooperative budget for one ingestion stage.
    pub fn stage_budget(&self) -> IngestBudget {
        IngestBudget::new(
            (self.max_time_per_stage_secs > 0)
                .then(|| Duration::from_secs(self.max_time_per_stage_secs)),
            (self.max_training_docs > 0).then_some(self.max_training_docs),
        )
    }
}

/// The assembled model: vocabulary, background distribution, document
/// table, and grid, plus the configuration that produced them. Immutable
/// once built; strategies and the harness only borrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoModel {
    pub config: Config,
    pub vocab: Vocab,
    pub background: GlobalUnigram,
    pub docs: DocumentTable,
    pub grid: Grid,
    /// Budget caveat recorded during ingestion, carried into reports.
    pub ingest_note: Option<String>,
}

impl GeoModel {
    /// Run the whole ingestion pipeline: metadata rows, redirects, counts
    /// blocks, model freezing, grid construction, memory reclamation.
    pub fn build<T: BufRead, C: BufRead>(
        config: Config,
        table_readers: Vec<T>,
        counts_readers: Vec<C>,
        stopwords: AHashSet<String>,
    ) -> Result<GeoModel> {
        config.validate()?;

        let mut table = DocumentTable::new();
        let mut note: Option<String> = None;

        let mut budget = config.stage_budget();
        for reader in table_readers {
            let summary = table.read_rows(reader, &mut budget)?;
            if let Some(reason) = summary.stopped {
                note = Some(reason.to_string());
                break;
            }
        }
        table.apply_redirects();
        info!(documents = table.len(), "document table loaded");

        let mut vocab = Vocab::new();
        let mut background = GlobalUnigram::new();
        let policy = config.counts_policy(stopwords);
        let mut budget = config.stage_budget();
        for reader in counts_readers {
            let summary =
                table.read_counts(reader, &mut vocab, &mut background, &policy, &mut budget)?;
            if let Some(reason) = summary.stopped {
                note = Some(reason.to_string());
                break;
            }
        }
        table.finish_models(config.minimum_word_count, &background);
        info!(
            vocabulary = vocab.len(),
            background_tokens = background.total_tokens(),
            "counts loaded"
        );

        let mut builder = GridBuilder::new(config.grid_params()?);
        for idx in 0..table.len() as u32 {
            if let Some(coord) = table.doc(idx).coord {
                builder.add_document(idx, coord);
            }
        }
        // Document models already enforced minimum_word_count; cells keep
        // every folded count.
        let grid = builder.build(&table, &background, 1, config.link_prior_all_splits);
        table.release_training_models();

        Ok(GeoModel {
            config,
            vocab,
            background,
            docs: table,
            grid,
            ingest_note: note,
        })
    }

    /// A ranker for `strategy` borrowing this model.
    pub fn ranker(&self, strategy: Strategy) -> Ranker<'_> {
        Ranker::new(
            strategy,
            &self.grid,
            &self.docs,
            &self.vocab,
            &self.background,
            self.config.lru_cache_size,
            self.config.random_seed,
        )
    }

    /// Persist the built model so later runs can skip ingestion.
    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(&path)
            .with_context(|| format!("creating snapshot {}", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &SNAPSHOT_VERSION)?;
        bincode::serialize_into(&mut writer, self)?;
        Ok(())
    }

    /// Load a model written by `save_bincode`, refusing other versions.
    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("opening snapshot {}", path.as_ref().display()))?;
        let mut reader = BufReader::new(file);
        let version: u32 = bincode::deserialize_from(&mut reader)?;
        if version != SNAPSHOT_VERSION {
            bail!(
                "snapshot version {} does not match expected {}",
                version,
                SNAPSHOT_VERSION
            );
        }
        Ok(bincode::deserialize_from(&mut reader)?)
    }
}

/// Utility helpers.
pub mod utils {
    /// Normalize tokens (NFC) and trim whitespace.
    pub fn normalize(s: &str) -> String {
        use unicode_normalization::UnicodeNormalization;
        s.nfc().collect::<String>().trim().to_string()
    }
}
