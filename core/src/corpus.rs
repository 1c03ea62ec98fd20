//! Document table and corpus ingestion.
//!
//! Two row formats feed the table:
//!
//! - tab-separated metadata rows with a header line naming the fields
//!   (field order is not significant, names are);
//! - word-count blocks introduced by `Article title:` / `Article ID:` lines,
//!   one `word = count` line per word, where the delimiter is
//!   space-equals-space followed by a non-negative integer.
//!
//! Malformed records are logged and skipped; ingestion aborts only when a
//! required header field is missing or every record was malformed. Optional
//! wall-clock and training-document budgets stop ingestion cleanly between
//! records via explicit `Continue`/`Stop` flow, never by unwinding.

use ahash::{AHashMap, AHashSet};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::coord::Coord;
use crate::unigram::{GlobalUnigram, SmoothedUnigram};
use crate::utils;
use crate::vocab::Vocab;

/// Which partition of the corpus a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Training,
    Dev,
    Test,
}

impl FromStr for Split {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "training" => Ok(Split::Training),
            "dev" => Ok(Split::Dev),
            "test" => Ok(Split::Test),
            other => bail!("unknown split '{}'", other),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Training => "training",
            Split::Dev => "dev",
            Split::Test => "test",
        })
    }
}

/// Per-document metadata. Coordinates and link counts stay optional; a
/// missing value is never silently zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub title: String,
    pub split: Split,
    pub coord: Option<Coord>,
    pub incoming_links: Option<u64>,
}

/// Word-loading policy applied while reading counts blocks.
#[derive(Debug, Clone, Default)]
pub struct CountsPolicy {
    pub preserve_case: bool,
    pub include_stopwords: bool,
    pub stopwords: AHashSet<String>,
}

impl CountsPolicy {
    /// Normalize a raw token under this policy. `None` means the token is
    /// dropped (stopword).
    fn prepare(&self, raw: &str) -> Option<String> {
        let word = utils::normalize(raw);
        let word = if self.preserve_case {
            word
        } else {
            word.to_lowercase()
        };
        if word.is_empty() {
            return None;
        }
        if !self.include_stopwords && self.stopwords.contains(&word) {
            return None;
        }
        Some(word)
    }
}

/// Why ingestion stopped before the stream ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    TimeBudget,
    DocBudget,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::TimeBudget => "wall-clock budget exhausted",
            StopReason::DocBudget => "training-document budget exhausted",
        })
    }
}

/// Loop flow decided between corpus records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestFlow {
    Continue,
    Stop(StopReason),
}

/// Cooperative per-stage budget, checked between records.
#[derive(Debug)]
pub struct IngestBudget {
    started: Instant,
    max_time: Option<Duration>,
    max_training_docs: Option<usize>,
    training_loaded: usize,
}

impl IngestBudget {
    pub fn new(max_time: Option<Duration>, max_training_docs: Option<usize>) -> Self {
        Self {
            started: Instant::now(),
            max_time,
            max_training_docs,
            training_loaded: 0,
        }
    }

    /// Unbounded budget.
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub fn note_training_doc(&mut self) {
        self.training_loaded += 1;
    }

    pub fn check(&self) -> IngestFlow {
        if let Some(max) = self.max_time {
            if self.started.elapsed() > max {
                return IngestFlow::Stop(StopReason::TimeBudget);
            }
        }
        if let Some(max) = self.max_training_docs {
            if self.training_loaded >= max {
                return IngestFlow::Stop(StopReason::DocBudget);
            }
        }
        IngestFlow::Continue
    }
}

/// Outcome of a metadata-row pass.
#[derive(Debug, Default, Clone)]
pub struct RowsSummary {
    pub rows_read: usize,
    pub documents_kept: usize,
    pub redirects: usize,
    pub skipped_namespace: usize,
    pub malformed: usize,
    pub stopped: Option<StopReason>,
}

/// Outcome of a counts pass.
#[derive(Debug, Default, Clone)]
pub struct CountsSummary {
    pub blocks_loaded: usize,
    pub unknown_title_blocks: usize,
    pub malformed_lines: usize,
    pub unknown_words_dropped: u64,
    pub stopped: Option<StopReason>,
}

/// The document table: metadata, per-document models, and the title index.
///
/// Models are populated by the counts pass, frozen by `finish_models`, and
/// released for training documents once the grid has absorbed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentTable {
    docs: Vec<DocumentMeta>,
    models: Vec<Option<SmoothedUnigram>>,
    by_title: AHashMap<String, u32>,
    /// (target title, links) pairs accumulated from redirect rows, applied
    /// at the end of the metadata pass.
    pending_redirects: Vec<(String, u64)>,
}

impl DocumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn doc(&self, idx: u32) -> &DocumentMeta {
        &self.docs[idx as usize]
    }

    pub fn model(&self, idx: u32) -> Option<&SmoothedUnigram> {
        self.models[idx as usize].as_ref()
    }

    pub fn doc_by_title(&self, title: &str) -> Option<u32> {
        self.by_title.get(title).copied()
    }

    /// Document indices of one split, in input order.
    pub fn iter_split(&self, split: Split) -> impl Iterator<Item = u32> + '_ {
        self.docs
            .iter()
            .enumerate()
            .filter(move |(_, d)| d.split == split)
            .map(|(i, _)| i as u32)
    }

    /// Append a document directly (corpus readers and tests).
    pub fn push_doc(&mut self, meta: DocumentMeta) -> u32 {
        let idx = self.docs.len() as u32;
        self.by_title.insert(meta.title.clone(), idx);
        self.docs.push(meta);
        self.models.push(None);
        idx
    }

    /// Install a model for a document directly (tests).
    pub fn set_model(&mut self, idx: u32, model: SmoothedUnigram) {
        self.models[idx as usize] = Some(model);
    }

    /// Read tab-separated metadata rows with a header line.
    ///
    /// Fields recognized: `id`, `title`, `split` (required), `redir`,
    /// `namespace`, `coord`, `incoming_links` (optional). Rows of other
    /// namespaces are ignored; redirect rows only contribute their link
    /// counts, resolved by `apply_redirects`.
    pub fn read_rows<R: BufRead>(
        &mut self,
        reader: R,
        budget: &mut IngestBudget,
    ) -> Result<RowsSummary> {
        let mut lines = reader.lines();
        let header = loop {
            match lines.next() {
                None => bail!("document table is empty: no header row"),
                Some(line) => {
                    let line = line.context("reading document-table header")?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
            }
        };

        let fields: Vec<&str> = header.split('\t').map(str::trim).collect();
        let field_idx = |name: &str| fields.iter().position(|f| *f == name);
        let idx_id = field_idx("id")
            .with_context(|| "document table header is missing required field 'id'")?;
        let idx_title = field_idx("title")
            .with_context(|| "document table header is missing required field 'title'")?;
        let idx_split = field_idx("split")
            .with_context(|| "document table header is missing required field 'split'")?;
        let idx_redir = field_idx("redir");
        let idx_namespace = field_idx("namespace");
        let idx_coord = field_idx("coord");
        let idx_links = field_idx("incoming_links");

        let mut summary = RowsSummary::default();
        let mut line_no = 1usize;

        for line in lines {
            line_no += 1;
            let line = line.with_context(|| format!("reading document table line {}", line_no))?;
            if line.trim().is_empty() {
                continue;
            }
            if let IngestFlow::Stop(reason) = budget.check() {
                info!(%reason, line = line_no, "document-table pass stopped");
                summary.stopped = Some(reason);
                break;
            }
            summary.rows_read += 1;

            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != fields.len() {
                warn!(
                    line = line_no,
                    expected = fields.len(),
                    got = cols.len(),
                    "row has wrong field count; skipped"
                );
                summary.malformed += 1;
                continue;
            }

            if let Some(i) = idx_namespace {
                if cols[i] != "Main" {
                    summary.skipped_namespace += 1;
                    continue;
                }
            }

            let links = match idx_links.map(|i| cols[i].trim()) {
                None | Some("") => None,
                Some(raw) => match raw.parse::<u64>() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!(line = line_no, field = "incoming_links", value = raw,
                              "unparseable link count; row skipped");
                        summary.malformed += 1;
                        continue;
                    }
                },
            };

            if let Some(i) = idx_redir {
                let target = cols[i].trim();
                if !target.is_empty() {
                    self.pending_redirects
                        .push((target.to_owned(), links.unwrap_or(0)));
                    summary.redirects += 1;
                    continue;
                }
            }

            let split = match cols[idx_split].trim().parse::<Split>() {
                Ok(s) => s,
                Err(_) => {
                    warn!(line = line_no, field = "split", value = cols[idx_split],
                          "unknown split; row skipped");
                    summary.malformed += 1;
                    continue;
                }
            };

            let coord = match idx_coord.map(|i| cols[i].trim()) {
                None | Some("") => None,
                Some(raw) => match raw.parse::<Coord>() {
                    Ok(c) => Some(c),
                    Err(_) => {
                        warn!(line = line_no, field = "coord", value = raw,
                              "unparseable coordinate; row skipped");
                        summary.malformed += 1;
                        continue;
                    }
                },
            };

            let title = cols[idx_title].trim();
            if title.is_empty() {
                warn!(line = line_no, field = "title", "empty title; row skipped");
                summary.malformed += 1;
                continue;
            }
            if self.by_title.contains_key(title) {
                warn!(line = line_no, title, "duplicate title; row skipped");
                summary.malformed += 1;
                continue;
            }

            self.push_doc(DocumentMeta {
                id: cols[idx_id].trim().to_owned(),
                title: title.to_owned(),
                split,
                coord,
                incoming_links: links,
            });
            summary.documents_kept += 1;
        }

        if summary.rows_read > 0 && summary.documents_kept == 0 && summary.redirects == 0 {
            if summary.malformed == summary.rows_read {
                bail!("every document-table row was malformed ({} rows)", summary.malformed);
            }
        }

        debug!(
            kept = summary.documents_kept,
            redirects = summary.redirects,
            malformed = summary.malformed,
            "document-table pass done"
        );
        Ok(summary)
    }

    /// Fold accumulated redirect link counts onto their targets.
    pub fn apply_redirects(&mut self) {
        let pending = std::mem::take(&mut self.pending_redirects);
        for (target, links) in pending {
            match self.by_title.get(&target) {
                Some(&idx) => {
                    let meta = &mut self.docs[idx as usize];
                    meta.incoming_links = Some(meta.incoming_links.unwrap_or(0) + links);
                }
                None => {
                    debug!(target, "redirect to unknown title ignored");
                }
            }
        }
    }

    /// Read word-count blocks, accumulating per-document models and the
    /// background distribution.
    ///
    /// Training-document words are memoized into `vocab` and added to `bg`;
    /// words of other splits resolve through `try_memoize` so unknown words
    /// never enter the vocabulary.
    pub fn read_counts<R: BufRead>(
        &mut self,
        reader: R,
        vocab: &mut Vocab,
        bg: &mut GlobalUnigram,
        policy: &CountsPolicy,
        budget: &mut IngestBudget,
    ) -> Result<CountsSummary> {
        let mut summary = CountsSummary::default();
        // Index of the block being accumulated; None while skipping an
        // unknown-title block.
        let mut current: Option<u32> = None;
        let mut line_no = 0usize;

        for line in reader.lines() {
            line_no += 1;
            let line = line.with_context(|| format!("reading counts line {}", line_no))?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(title) = line.strip_prefix("Article title: ") {
                if let IngestFlow::Stop(reason) = budget.check() {
                    info!(%reason, line = line_no, "counts pass stopped");
                    summary.stopped = Some(reason);
                    current = None;
                    break;
                }
                match self.by_title.get(title.trim()) {
                    Some(&idx) => {
                        current = Some(idx);
                        summary.blocks_loaded += 1;
                        if self.docs[idx as usize].split == Split::Training {
                            budget.note_training_doc();
                        }
                    }
                    None => {
                        warn!(line = line_no, title, "counts block for unknown title; skipped");
                        summary.unknown_title_blocks += 1;
                        current = None;
                    }
                }
                continue;
            }

            if let Some(id) = line.strip_prefix("Article ID: ") {
                if let Some(idx) = current {
                    let expect = &self.docs[idx as usize].id;
                    if expect != id.trim() {
                        warn!(line = line_no, expected = %expect, got = id, "article id mismatch");
                    }
                }
                continue;
            }

            let Some(idx) = current else {
                continue;
            };

            let Some((raw_word, raw_count)) = line.rsplit_once(" = ") else {
                warn!(line = line_no, "counts line without ' = ' delimiter; skipped");
                summary.malformed_lines += 1;
                continue;
            };
            let count: u32 = match raw_count.trim().parse() {
                Ok(c) => c,
                Err(_) => {
                    warn!(line = line_no, value = raw_count, "unparseable count; line skipped");
                    summary.malformed_lines += 1;
                    continue;
                }
            };
            let Some(word) = policy.prepare(raw_word) else {
                continue;
            };

            let meta = &self.docs[idx as usize];
            let word_id = if meta.split == Split::Training {
                let id = vocab.memoize(&word);
                bg.add(id, count as u64);
                Some(id)
            } else {
                let id = vocab.try_memoize(&word);
                if id.is_none() {
                    summary.unknown_words_dropped += 1;
                }
                id
            };

            if let Some(id) = word_id {
                self.models[idx as usize]
                    .get_or_insert_with(SmoothedUnigram::new)
                    .add_count(id, count);
            }
        }

        debug!(
            blocks = summary.blocks_loaded,
            malformed = summary.malformed_lines,
            dropped = summary.unknown_words_dropped,
            "counts pass done"
        );
        Ok(summary)
    }

    /// Freeze every accumulated document model.
    pub fn finish_models(&mut self, min_count: u32, bg: &GlobalUnigram) {
        for model in self.models.iter_mut().flatten() {
            if !model.is_finished() {
                model.finish(min_count, bg);
            }
        }
    }

    /// Drop training-document models once the grid has absorbed them.
    pub fn release_training_models(&mut self) {
        let mut released = 0usize;
        for (i, model) in self.models.iter_mut().enumerate() {
            if self.docs[i].split == Split::Training && model.is_some() {
                *model = None;
                released += 1;
            }
        }
        debug!(released, "training document models released");
    }
}
