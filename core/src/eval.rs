//! Evaluation harness.
//!
//! Streams the documents of one split in input order, asks the strategy for
//! a best-first ranking, and scores the top cell's center against the true
//! coordinate. No per-document failure is fatal: documents without
//! coordinates or models are tallied and skipped, an empty ranking becomes
//! an "unable to predict" outcome, and the report carries whatever budget
//! annotation ingestion left behind.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::coord::MILES_PER_DEGREE;
use crate::corpus::{DocumentTable, Split};
use crate::grid::Grid;
use crate::strategy::Ranker;

/// Ranks at which accuracy is reported.
const ACCURACY_RANKS: [usize; 5] = [1, 5, 10, 50, 100];

/// Harness controls.
#[derive(Debug, Clone)]
pub struct EvalOpts {
    pub split: Split,
    /// Skip this many documents from the front of the split.
    pub skip_initial: usize,
    /// Evaluate every n-th remaining document.
    pub every_nth: usize,
    /// Stop after this many evaluations.
    pub max_docs: Option<usize>,
    /// Score the true cell directly, bounding the best the strategy could
    /// possibly do on this grid.
    pub oracle: bool,
}

impl Default for EvalOpts {
    fn default() -> Self {
        Self {
            split: Split::Dev,
            skip_initial: 0,
            every_nth: 1,
            max_docs: None,
            oracle: false,
        }
    }
}

/// How one document fared.
#[derive(Debug, Clone, PartialEq)]
pub enum DocOutcome {
    Scored {
        error_miles: f64,
        /// 1-based rank of the true cell, when it exists in the ranking.
        true_rank: Option<usize>,
    },
    NoCoord,
    NoModel,
    NoPrediction,
}

/// Aggregate results over one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub split: String,
    pub oracle: bool,
    pub considered: usize,
    pub evaluated: usize,
    pub scored: usize,
    pub no_coord: usize,
    pub no_model: usize,
    pub no_prediction: usize,
    pub mean_error_miles: Option<f64>,
    pub median_error_miles: Option<f64>,
    pub mean_error_degrees: Option<f64>,
    pub median_error_degrees: Option<f64>,
    /// (rank, fraction of scored documents whose true cell ranked there or
    /// better).
    pub accuracy_at: Vec<(usize, f64)>,
    /// Budget or other caveats attached by the driver.
    pub annotation: Option<String>,
}

impl EvalReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.evaluated == 0 {
            writeln!(f, "no documents evaluated (split: {})", self.split)?;
            if let Some(note) = &self.annotation {
                writeln!(f, "note: {}", note)?;
            }
            return Ok(());
        }
        writeln!(
            f,
            "evaluation over split '{}'{}:",
            self.split,
            if self.oracle { " (oracle)" } else { "" }
        )?;
        writeln!(
            f,
            "  documents: {} considered, {} evaluated, {} scored",
            self.considered, self.evaluated, self.scored
        )?;
        writeln!(
            f,
            "  skipped: {} without coordinates, {} without models, {} unpredictable",
            self.no_coord, self.no_model, self.no_prediction
        )?;
        if let (Some(mean), Some(median)) = (self.mean_error_miles, self.median_error_miles) {
            writeln!(f, "  mean error:   {:.1} miles ({:.2} degrees)", mean,
                     self.mean_error_degrees.unwrap_or(mean / MILES_PER_DEGREE))?;
            writeln!(f, "  median error: {:.1} miles ({:.2} degrees)", median,
                     self.median_error_degrees.unwrap_or(median / MILES_PER_DEGREE))?;
        }
        for (rank, acc) in &self.accuracy_at {
            writeln!(f, "  accuracy@{}: {:.3}", rank, acc)?;
        }
        if let Some(note) = &self.annotation {
            writeln!(f, "  note: {}", note)?;
        }
        Ok(())
    }
}

/// Runs a strategy over one split of the document table.
#[derive(Debug, Clone)]
pub struct Evaluator {
    opts: EvalOpts,
}

impl Evaluator {
    pub fn new(opts: EvalOpts) -> Self {
        Self { opts }
    }

    /// Evaluate every selected document and fold the outcomes into a
    /// report. `annotation` is carried through verbatim.
    pub fn run(
        &self,
        table: &DocumentTable,
        grid: &Grid,
        ranker: &Ranker<'_>,
        annotation: Option<String>,
    ) -> EvalReport {
        let mut considered = 0usize;
        let mut evaluated = 0usize;
        let mut no_coord = 0usize;
        let mut no_model = 0usize;
        let mut no_prediction = 0usize;
        let mut errors_miles: Vec<f64> = Vec::new();
        let mut true_ranks: Vec<Option<usize>> = Vec::new();

        for (i, idx) in table.iter_split(self.opts.split).enumerate() {
            considered += 1;
            if i < self.opts.skip_initial {
                continue;
            }
            if (i - self.opts.skip_initial) % self.opts.every_nth != 0 {
                continue;
            }
            if let Some(cap) = self.opts.max_docs {
                if evaluated >= cap {
                    break;
                }
            }
            evaluated += 1;

            match self.evaluate_one(table, grid, ranker, idx) {
                DocOutcome::Scored { error_miles, true_rank } => {
                    errors_miles.push(error_miles);
                    true_ranks.push(true_rank);
                }
                DocOutcome::NoCoord => no_coord += 1,
                DocOutcome::NoModel => no_model += 1,
                DocOutcome::NoPrediction => no_prediction += 1,
            }
        }

        let scored = errors_miles.len();
        let mean = mean(&errors_miles);
        let median = median(&mut errors_miles);
        let accuracy_at = ACCURACY_RANKS
            .iter()
            .map(|&k| {
                let hits = true_ranks
                    .iter()
                    .filter(|r| r.is_some_and(|rank| rank <= k))
                    .count();
                let frac = if scored > 0 { hits as f64 / scored as f64 } else { 0.0 };
                (k, frac)
            })
            .collect();

        info!(evaluated, scored, no_prediction, "evaluation done");

        EvalReport {
            split: self.opts.split.to_string(),
            oracle: self.opts.oracle,
            considered,
            evaluated,
            scored,
            no_coord,
            no_model,
            no_prediction,
            mean_error_miles: mean,
            median_error_miles: median,
            mean_error_degrees: mean.map(|m| m / MILES_PER_DEGREE),
            median_error_degrees: median.map(|m| m / MILES_PER_DEGREE),
            accuracy_at,
            annotation,
        }
    }

    fn evaluate_one(
        &self,
        table: &DocumentTable,
        grid: &Grid,
        ranker: &Ranker<'_>,
        idx: u32,
    ) -> DocOutcome {
        let meta = table.doc(idx);
        let Some(coord) = meta.coord else {
            debug!(title = %meta.title, "document without coordinates");
            return DocOutcome::NoCoord;
        };
        let Some(model) = table.model(idx) else {
            debug!(title = %meta.title, "document without a model");
            return DocOutcome::NoModel;
        };

        let true_cell = grid.cell_for_coord(coord);

        if self.opts.oracle {
            let Some(tc) = true_cell else {
                return DocOutcome::NoPrediction;
            };
            let error_miles = grid.cell_center(tc).distance_miles(&coord);
            return DocOutcome::Scored { error_miles, true_rank: Some(1) };
        }

        let ranking = ranker.rank(model);
        let Some(&(predicted, _)) = ranking.first() else {
            debug!(title = %meta.title, "strategy returned an empty ranking");
            return DocOutcome::NoPrediction;
        };

        let error_miles = grid.cell_center(predicted).distance_miles(&coord);
        let true_rank = true_cell
            .and_then(|tc| ranking.iter().position(|&(c, _)| c == tc))
            .map(|p| p + 1);
        DocOutcome::Scored { error_miles, true_rank }
    }
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

fn median(xs: &mut [f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = xs.len() / 2;
    Some(if xs.len() % 2 == 1 {
        xs[mid]
    } else {
        (xs[mid - 1] + xs[mid]) / 2.0
    })
}
