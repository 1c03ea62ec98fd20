//! geolocate: build a grid from a geotagged corpus and evaluate a ranking
//! strategy over it.
//!
//! The corpus arrives as document-table TSV files plus word-count files;
//! alternatively a previously saved model snapshot skips ingestion. All
//! options mirror `geolocate_core::Config`; flags given here override the
//! optional `--config` TOML file.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use ahash::AHashSet;
use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use geolocate_core::{Config, EvalReport, Evaluator, GeoModel};

#[derive(Parser, Debug)]
#[command(name = "geolocate", version, about = "Document geolocation by language matching")]
struct Args {
    /// Document metadata table (TSV with header); repeatable
    #[arg(long = "document-file", value_name = "FILE")]
    document_files: Vec<PathBuf>,

    /// Word-count blocks file; repeatable
    #[arg(long = "counts-file", value_name = "FILE")]
    counts_files: Vec<PathBuf>,

    /// Stopword list, one word per line
    #[arg(long, value_name = "FILE")]
    stopwords_file: Option<PathBuf>,

    /// Base configuration TOML; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    strategy: Option<String>,
    #[arg(long)]
    baseline: Option<String>,

    #[arg(long)]
    degrees_per_region: Option<f64>,
    /// Overrides --degrees-per-region when set
    #[arg(long)]
    miles_per_region: Option<f64>,
    #[arg(long)]
    width_of_stat_region: Option<u32>,

    #[arg(long)]
    minimum_word_count: Option<u32>,
    #[arg(long)]
    preserve_case: bool,
    #[arg(long)]
    include_stopwords_in_doc_dists: bool,

    #[arg(long)]
    lru_cache_size: Option<usize>,
    #[arg(long)]
    nb_weighting: Option<String>,
    #[arg(long)]
    nb_baseline_weight: Option<f64>,
    #[arg(long)]
    random_seed: Option<u64>,

    #[arg(long)]
    eval_split: Option<String>,
    #[arg(long)]
    skip_initial: Option<usize>,
    #[arg(long)]
    every_nth: Option<usize>,
    #[arg(long)]
    num_test_docs: Option<usize>,
    /// Score the true cell directly instead of predicting
    #[arg(long)]
    oracle: bool,

    #[arg(long)]
    max_time_per_stage_secs: Option<u64>,
    #[arg(long)]
    max_training_docs: Option<usize>,

    /// Write the built model to this snapshot
    #[arg(long, value_name = "FILE")]
    save_model: Option<PathBuf>,
    /// Load a snapshot instead of ingesting a corpus
    #[arg(long, value_name = "FILE")]
    load_model: Option<PathBuf>,

    /// Emit the evaluation report as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Overlay command-line flags onto a base configuration.
    fn apply_to(&self, config: &mut Config) {
        if let Some(v) = &self.strategy {
            config.strategy = v.clone();
        }
        if let Some(v) = &self.baseline {
            config.baseline = v.clone();
        }
        if let Some(v) = &self.nb_weighting {
            config.nb_weighting = v.clone();
        }
        if let Some(v) = &self.eval_split {
            config.eval_split = v.clone();
        }
        if let Some(v) = self.degrees_per_region {
            config.degrees_per_region = v;
        }
        if self.miles_per_region.is_some() {
            config.miles_per_region = self.miles_per_region;
        }
        if let Some(v) = self.width_of_stat_region {
            config.width_of_stat_region = v;
        }
        if let Some(v) = self.minimum_word_count {
            config.minimum_word_count = v;
        }
        if self.preserve_case {
            config.preserve_case = true;
        }
        if self.include_stopwords_in_doc_dists {
            config.include_stopwords_in_doc_dists = true;
        }
        if let Some(v) = self.lru_cache_size {
            config.lru_cache_size = v;
        }
        if let Some(v) = self.nb_baseline_weight {
            config.nb_baseline_weight = v;
        }
        if let Some(v) = self.random_seed {
            config.random_seed = v;
        }
        if let Some(v) = self.skip_initial {
            config.skip_initial = v;
        }
        if let Some(v) = self.every_nth {
            config.every_nth = v;
        }
        if let Some(v) = self.num_test_docs {
            config.num_test_docs = v;
        }
        if self.oracle {
            config.oracle = true;
        }
        if let Some(v) = self.max_time_per_stage_secs {
            config.max_time_per_stage_secs = v;
        }
        if let Some(v) = self.max_training_docs {
            config.max_training_docs = v;
        }
    }
}

fn load_stopwords(path: &PathBuf, preserve_case: bool) -> Result<AHashSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading stopwords {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            if preserve_case {
                l.to_string()
            } else {
                l.to_lowercase()
            }
        })
        .collect())
}

fn open(path: &PathBuf) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path).with_context(|| {
        format!("opening {}", path.display())
    })?))
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let model = match &args.load_model {
        Some(path) => {
            info!(snapshot = %path.display(), "loading model snapshot");
            let mut model = GeoModel::load_bincode(path)?;
            // The snapshot keeps its grid; evaluation-side options still
            // come from this invocation.
            args.apply_to(&mut model.config);
            model.config.validate()?;
            model
        }
        None => {
            let mut config = match &args.config {
                Some(path) => Config::load_toml(path)?,
                None => Config::default(),
            };
            args.apply_to(&mut config);
            config.validate()?;

            if args.document_files.is_empty() {
                bail!("no input: pass --document-file (with --counts-file) or --load-model");
            }
            let stopwords = match &args.stopwords_file {
                Some(path) => load_stopwords(path, config.preserve_case)?,
                None => AHashSet::new(),
            };

            let mut tables = Vec::new();
            for path in &args.document_files {
                tables.push(open(path)?);
            }
            let mut counts = Vec::new();
            for path in &args.counts_files {
                counts.push(open(path)?);
            }
            GeoModel::build(config, tables, counts, stopwords)?
        }
    };

    if let Some(path) = &args.save_model {
        model.save_bincode(path)?;
        info!(snapshot = %path.display(), "model snapshot written");
    }

    let Some(strategy) = model.config.parse_strategy()? else {
        println!(
            "grid built: {} cells ({} with empty models); no evaluation requested",
            model.grid.num_cells(),
            model.grid.num_empty_models()
        );
        return Ok(());
    };

    let ranker = model.ranker(strategy);
    let report: EvalReport = Evaluator::new(model.config.eval_opts()?).run(
        &model.docs,
        &model.grid,
        &ranker,
        model.ingest_note.clone(),
    );

    let (hits, misses) = ranker.cache_stats();
    debug!(hits, misses, "posterior cache");

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
