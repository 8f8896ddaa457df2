//! Ingestion coordinator: scan, fan out per-file work, aggregate stats, flush batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use advo_core::{validate_advocate, Advocate, IngestStats};
use advo_intake::{clean_advocate, decode_file, DecodeError, FileScanner, Payload, ScanEntry};
use advo_storage::{AdvocateStore, QuarantineWriter};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "advo-ingest";

pub const DEFAULT_INGEST_DIR: &str = "./raw_data";
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub ingest_dir: PathBuf,
    pub max_workers: usize,
    pub batch_size: usize,
    pub dry_run: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ingest_dir: PathBuf::from(DEFAULT_INGEST_DIR),
            max_workers: DEFAULT_MAX_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ingest_dir: std::env::var("ADVO_INGEST_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ingest_dir),
            max_workers: std::env::var("ADVO_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_workers),
            batch_size: std::env::var("ADVO_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            dry_run: std::env::var("ADVO_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.dry_run),
        }
    }

    /// Loads a YAML config file. Keys left out fall back to the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading ingest config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing ingest config {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn worker_limit(&self) -> usize {
        self.max_workers.max(1)
    }

    fn flush_threshold(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Scanning,
    Processing,
    Flushing,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest_dir: String,
    pub directory_found: bool,
    pub dry_run: bool,
    pub stats: IngestStats,
    pub batches_flushed: usize,
    pub records_flushed: usize,
    pub flush_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDisposition {
    Parsed,
    Skipped,
}

/// What one worker learned about one file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub disposition: FileDisposition,
    pub valid: Vec<Advocate>,
    pub invalid: u64,
}

impl FileOutcome {
    fn skipped(path: PathBuf) -> Self {
        Self {
            path,
            disposition: FileDisposition::Skipped,
            valid: Vec::new(),
            invalid: 0,
        }
    }

    fn parsed(path: PathBuf) -> Self {
        Self {
            path,
            disposition: FileDisposition::Parsed,
            valid: Vec::new(),
            invalid: 0,
        }
    }
}

/// Decodes, cleans and validates a single file. Invalid input is quarantined here;
/// nothing in this function touches shared run state.
pub async fn process_file(quarantine: &QuarantineWriter, path: &Path) -> FileOutcome {
    let decoded = match decode_file(path).await {
        Ok(decoded) => decoded,
        Err(DecodeError::Unparsable { path, text, attempts }) => {
            let tried: Vec<_> = attempts.iter().map(|a| a.strategy.name()).collect();
            warn!(path = %path.display(), strategies = ?tried, "file is not parseable as json");
            quarantine.quarantine_invalid_json(&path, &text).await;
            return FileOutcome::skipped(path);
        }
        Err(err @ DecodeError::NotText { .. }) => {
            debug!(error = %err, "skipping file");
            return FileOutcome::skipped(path.to_path_buf());
        }
        Err(err @ DecodeError::Read { .. }) => {
            warn!(error = %err, "skipping unreadable file");
            return FileOutcome::skipped(path.to_path_buf());
        }
    };

    let mut outcome = FileOutcome::parsed(decoded.path);
    for (index, candidate) in Payload::from(decoded.value).into_candidates() {
        let cleaned = candidate.as_object().map(clean_advocate).unwrap_or(candidate);
        match validate_advocate(&cleaned) {
            Ok(advocate) => outcome.valid.push(advocate),
            Err(errors) => {
                outcome.invalid += 1;
                debug!(
                    path = %outcome.path.display(),
                    index = ?index,
                    fields = ?errors.paths(),
                    "record failed validation"
                );
                quarantine
                    .quarantine_failed_validation(&outcome.path, index, &errors, &cleaned)
                    .await;
            }
        }
    }
    outcome
}

#[derive(Debug, Default)]
struct FlushTally {
    batches: usize,
    records: usize,
    failures: usize,
}

pub struct IngestPipeline {
    config: IngestConfig,
    store: Option<Arc<dyn AdvocateStore>>,
    quarantine: Arc<QuarantineWriter>,
    phase: RunPhase,
    stats: IngestStats,
    advocates: Vec<Advocate>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        let quarantine = Arc::new(QuarantineWriter::for_ingest_dir(&config.ingest_dir));
        Self {
            config,
            store: None,
            quarantine,
            phase: RunPhase::Idle,
            stats: IngestStats::default(),
            advocates: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AdvocateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_quarantine(mut self, quarantine: QuarantineWriter) -> Self {
        self.quarantine = Arc::new(quarantine);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Valid advocates collected in dry-run mode, in completion order.
    pub fn advocates(&self) -> &[Advocate] {
        &self.advocates
    }

    pub fn into_advocates(self) -> Vec<Advocate> {
        self.advocates
    }

    /// The sink records are flushed to; `None` means dry-run collection.
    fn sink(&self) -> Option<Arc<dyn AdvocateStore>> {
        if self.config.dry_run {
            None
        } else {
            self.store.clone()
        }
    }

    pub async fn run(&mut self) -> IngestStats {
        self.run_with_summary().await.stats
    }

    pub async fn run_with_summary(&mut self) -> IngestRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_run",
            %run_id,
            ingest_dir = %self.config.ingest_dir.display()
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid) -> IngestRunSummary {
        let started_at = Utc::now();
        self.stats = IngestStats::default();
        self.advocates.clear();
        let sink = self.sink();
        let mut tally = FlushTally::default();

        self.phase = RunPhase::Scanning;
        let worklist = self.scan();
        let directory_found = worklist.is_some();
        let worklist = worklist.unwrap_or_default();

        if worklist.is_empty() {
            info!("no candidate json files to ingest");
        } else {
            self.phase = RunPhase::Processing;
            let mut batch = Vec::new();
            let permits = Arc::new(Semaphore::new(self.config.worker_limit()));
            let mut tasks = JoinSet::new();

            for path in worklist {
                let permits = Arc::clone(&permits);
                let quarantine = Arc::clone(&self.quarantine);
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                    process_file(&quarantine, &path).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => self.absorb(outcome, sink.as_deref(), &mut batch, &mut tally).await,
                    Err(err) => {
                        error!(error = %err, "file worker failed");
                        self.stats.files_skipped += 1;
                    }
                }
            }

            self.phase = RunPhase::Flushing;
            if let Some(store) = sink.as_deref() {
                flush(store, &mut batch, &mut tally).await;
            }
        }

        self.phase = RunPhase::Done;
        info!(stats = %self.stats, batches = tally.batches, "ingest run finished");

        IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            ingest_dir: self.config.ingest_dir.display().to_string(),
            directory_found,
            dry_run: sink.is_none(),
            stats: self.stats,
            batches_flushed: tally.batches,
            records_flushed: tally.records,
            flush_failures: tally.failures,
        }
    }

    /// Enumerates candidates, counting junk on the way. `None` when the directory is missing.
    fn scan(&mut self) -> Option<Vec<PathBuf>> {
        let scanner = match FileScanner::open(&self.config.ingest_dir) {
            Ok(scanner) => scanner,
            Err(err) => {
                warn!(error = %err, "ingest directory unavailable");
                return None;
            }
        };

        let mut worklist = Vec::new();
        for entry in scanner {
            self.stats.files_seen += 1;
            match entry {
                ScanEntry::Candidate(path) => worklist.push(path),
                ScanEntry::Junk(path) => {
                    debug!(path = %path.display(), "skipping junk file");
                    self.stats.files_skipped += 1;
                }
            }
        }
        worklist.sort();
        Some(worklist)
    }

    async fn absorb(
        &mut self,
        outcome: FileOutcome,
        sink: Option<&dyn AdvocateStore>,
        batch: &mut Vec<Advocate>,
        tally: &mut FlushTally,
    ) {
        match outcome.disposition {
            FileDisposition::Parsed => self.stats.files_parsed += 1,
            FileDisposition::Skipped => self.stats.files_skipped += 1,
        }
        self.stats.records_invalid += outcome.invalid;
        self.stats.records_valid += outcome.valid.len() as u64;

        let Some(store) = sink else {
            self.advocates.extend(outcome.valid);
            return;
        };
        let threshold = self.config.flush_threshold();
        for advocate in outcome.valid {
            batch.push(advocate);
            if batch.len() >= threshold {
                flush(store, batch, tally).await;
            }
        }
    }
}

async fn flush(store: &dyn AdvocateStore, batch: &mut Vec<Advocate>, tally: &mut FlushTally) {
    if batch.is_empty() {
        return;
    }
    let len = batch.len();
    match store.add_advocates(batch.as_slice()).await {
        Ok(()) => {
            tally.batches += 1;
            tally.records += len;
            debug!(records = len, "flushed batch");
        }
        Err(err) => {
            tally.failures += 1;
            error!(records = len, error = %err, "failed to flush batch");
        }
    }
    batch.clear();
}

/// Runs one pass over `config.ingest_dir`, flushing into `store` unless the config asks for a dry run.
pub async fn run_ingest(config: IngestConfig, store: Option<Arc<dyn AdvocateStore>>) -> IngestRunSummary {
    let mut pipeline = IngestPipeline::new(config);
    if let Some(store) = store {
        pipeline = pipeline.with_store(store);
    }
    pipeline.run_with_summary().await
}
