//! Persistence sink contract, in-memory advocate store and quarantine artifact writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use advo_core::{Advocate, FieldViolation, ValidationErrors};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "advo-storage";

pub const INVALID_JSON_SUFFIX: &str = "_invalid_json";
pub const FAILED_VALIDATION_SUFFIX: &str = "_failed_validation";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported metric: {0}")]
    UnsupportedMetric(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopMetric {
    Conversions,
    Engagement,
}

impl FromStr for TopMetric {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversions" => Ok(TopMetric::Conversions),
            "engagement" => Ok(TopMetric::Engagement),
            other => Err(StoreError::UnsupportedMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierMetric {
    Sales,
    Engagement,
}

impl FromStr for OutlierMetric {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sales" => Ok(OutlierMetric::Sales),
            "engagement" => Ok(OutlierMetric::Engagement),
            other => Err(StoreError::UnsupportedMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub user_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementTotals {
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandPerformance {
    pub brand: String,
    pub total_tasks: u64,
    pub engagement: EngagementTotals,
    pub total_reach: u64,
    pub total_sales: f64,
}

/// Sink for validated advocates plus the read-only queries the API layer exposes.
///
/// `add_advocates` is at-least-once: a retried batch may land twice.
#[async_trait]
pub trait AdvocateStore: Send + Sync {
    async fn add_advocates(&self, batch: &[Advocate]) -> Result<(), StoreError>;

    async fn get_advocate(&self, user_id: &str) -> Result<Option<Advocate>, StoreError>;

    async fn top_advocates(
        &self,
        metric: TopMetric,
        limit: usize,
    ) -> Result<Vec<MetricValue>, StoreError>;

    async fn brand_performance(&self) -> Result<Vec<BrandPerformance>, StoreError>;

    async fn outliers(
        &self,
        metric: OutlierMetric,
        stddev: f64,
    ) -> Result<Vec<MetricValue>, StoreError>;
}

fn sort_desc(rows: &mut [MetricValue]) {
    rows.sort_by(|a, b| {
        b.value
            .total_cmp(&a.value)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

/// Per-user totals; advocates without programs (conversions) or tasks (engagement) are left out.
pub fn rank_advocates(advocates: &[Advocate], metric: TopMetric, limit: usize) -> Vec<MetricValue> {
    let mut totals = BTreeMap::<&str, f64>::new();
    for advocate in advocates {
        match metric {
            TopMetric::Conversions if !advocate.advocacy_programs.is_empty() => {
                *totals.entry(&advocate.user_id).or_default() += advocate.total_sales();
            }
            TopMetric::Engagement if advocate.tasks().next().is_some() => {
                *totals.entry(&advocate.user_id).or_default() += advocate.total_engagement() as f64;
            }
            _ => {}
        }
    }
    let mut rows = totals
        .into_iter()
        .map(|(user_id, value)| MetricValue {
            user_id: user_id.to_string(),
            value,
        })
        .collect::<Vec<_>>();
    sort_desc(&mut rows);
    rows.truncate(limit);
    rows
}

/// Brand roll-up. Each program's sales count once, whether or not it has tasks.
pub fn summarize_brands(advocates: &[Advocate]) -> Vec<BrandPerformance> {
    let mut by_brand = BTreeMap::<&str, BrandPerformance>::new();
    for program in advocates.iter().flat_map(|a| a.advocacy_programs.iter()) {
        let row = by_brand
            .entry(&program.brand)
            .or_insert_with(|| BrandPerformance {
                brand: program.brand.clone(),
                total_tasks: 0,
                engagement: EngagementTotals::default(),
                total_reach: 0,
                total_sales: 0.0,
            });
        row.total_sales += program.total_sales_attributed;
        for task in &program.tasks_completed {
            row.total_tasks = row.total_tasks.saturating_add(1);
            row.engagement.likes = row.engagement.likes.saturating_add(task.likes);
            row.engagement.comments = row.engagement.comments.saturating_add(task.comments);
            row.engagement.shares = row.engagement.shares.saturating_add(task.shares);
            row.total_reach = row.total_reach.saturating_add(task.reach);
        }
    }
    let mut rows = by_brand.into_values().collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.total_sales
            .total_cmp(&a.total_sales)
            .then_with(|| a.brand.cmp(&b.brand))
    });
    rows
}

/// Advocates whose metric sits strictly above `mean + stddev * sigma` (population sigma).
pub fn find_outliers(advocates: &[Advocate], metric: OutlierMetric, stddev: f64) -> Vec<MetricValue> {
    let dataset = advocates
        .iter()
        .map(|a| MetricValue {
            user_id: a.user_id.clone(),
            value: match metric {
                OutlierMetric::Sales => a.total_sales(),
                OutlierMetric::Engagement => a.total_engagement() as f64,
            },
        })
        .collect::<Vec<_>>();
    if dataset.is_empty() {
        return Vec::new();
    }

    let n = dataset.len() as f64;
    let mean = dataset.iter().map(|d| d.value).sum::<f64>() / n;
    let variance = dataset.iter().map(|d| (d.value - mean).powi(2)).sum::<f64>() / n;
    let upper_limit = mean + stddev * variance.sqrt();

    dataset
        .into_iter()
        .filter(|d| d.value > upper_limit)
        .collect()
}

/// Process-local store; backs dry runs, tests and the HTTP server.
#[derive(Debug, Default)]
pub struct MemoryAdvocateStore {
    advocates: RwLock<Vec<Advocate>>,
}

impl MemoryAdvocateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.advocates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.advocates.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Advocate> {
        self.advocates.read().await.clone()
    }
}

#[async_trait]
impl AdvocateStore for MemoryAdvocateStore {
    async fn add_advocates(&self, batch: &[Advocate]) -> Result<(), StoreError> {
        self.advocates.write().await.extend_from_slice(batch);
        debug!(batch_len = batch.len(), "stored advocate batch");
        Ok(())
    }

    async fn get_advocate(&self, user_id: &str) -> Result<Option<Advocate>, StoreError> {
        let advocates = self.advocates.read().await;
        Ok(advocates.iter().find(|a| a.user_id == user_id).cloned())
    }

    async fn top_advocates(
        &self,
        metric: TopMetric,
        limit: usize,
    ) -> Result<Vec<MetricValue>, StoreError> {
        Ok(rank_advocates(&self.advocates.read().await, metric, limit))
    }

    async fn brand_performance(&self) -> Result<Vec<BrandPerformance>, StoreError> {
        Ok(summarize_brands(&self.advocates.read().await))
    }

    async fn outliers(
        &self,
        metric: OutlierMetric,
        stddev: f64,
    ) -> Result<Vec<MetricValue>, StoreError> {
        Ok(find_outliers(&self.advocates.read().await, metric, stddev))
    }
}

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("creating quarantine directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing quarantine artifact {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing quarantine artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Body of a `<stem>_record_invalid[_<idx>].json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedValidationRecord {
    pub source_file: String,
    pub validation_errors: Vec<FieldViolation>,
    pub record: JsonValue,
}

/// Writes rejected input next to the ingest directory. Directories are created on first use.
#[derive(Debug, Clone)]
pub struct QuarantineWriter {
    invalid_json_dir: PathBuf,
    failed_validation_dir: PathBuf,
}

impl QuarantineWriter {
    pub fn new(invalid_json_dir: impl Into<PathBuf>, failed_validation_dir: impl Into<PathBuf>) -> Self {
        Self {
            invalid_json_dir: invalid_json_dir.into(),
            failed_validation_dir: failed_validation_dir.into(),
        }
    }

    pub fn for_ingest_dir(ingest_dir: &Path) -> Self {
        let name = ingest_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ingest".to_string());
        let parent = ingest_dir.parent().unwrap_or_else(|| Path::new("."));
        Self::new(
            parent.join(format!("{name}{INVALID_JSON_SUFFIX}")),
            parent.join(format!("{name}{FAILED_VALIDATION_SUFFIX}")),
        )
    }

    pub fn invalid_json_dir(&self) -> &Path {
        &self.invalid_json_dir
    }

    pub fn failed_validation_dir(&self) -> &Path {
        &self.failed_validation_dir
    }

    pub fn invalid_json_path(&self, source: &Path) -> PathBuf {
        self.invalid_json_dir
            .join(format!("{}_record_invalid_json.txt", file_stem(source)))
    }

    /// `index` is the record's position when the source file held a list.
    pub fn failed_validation_path(&self, source: &Path, index: Option<usize>) -> PathBuf {
        let name = match index {
            Some(idx) => format!("{}_record_invalid_{idx}.json", file_stem(source)),
            None => format!("{}_record_invalid.json", file_stem(source)),
        };
        self.failed_validation_dir.join(name)
    }

    pub async fn write_invalid_json(
        &self,
        source: &Path,
        raw_text: &str,
    ) -> Result<PathBuf, QuarantineError> {
        let target = self.invalid_json_path(source);
        let body = serde_json::to_vec_pretty(raw_text)?;
        write_atomically(&self.invalid_json_dir, &target, &body).await?;
        Ok(target)
    }

    pub async fn write_failed_validation(
        &self,
        source: &Path,
        index: Option<usize>,
        errors: &ValidationErrors,
        record: &JsonValue,
    ) -> Result<PathBuf, QuarantineError> {
        let target = self.failed_validation_path(source, index);
        let payload = FailedValidationRecord {
            source_file: source.display().to_string(),
            validation_errors: errors.violations.clone(),
            record: record.clone(),
        };
        let body = serde_json::to_vec_pretty(&payload)?;
        write_atomically(&self.failed_validation_dir, &target, &body).await?;
        Ok(target)
    }

    /// Like [`Self::write_invalid_json`], but failures are logged and swallowed.
    pub async fn quarantine_invalid_json(&self, source: &Path, raw_text: &str) -> Option<PathBuf> {
        match self.write_invalid_json(source, raw_text).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(source = %source.display(), error = %err, "failed to quarantine invalid json");
                None
            }
        }
    }

    pub async fn quarantine_failed_validation(
        &self,
        source: &Path,
        index: Option<usize>,
        errors: &ValidationErrors,
        record: &JsonValue,
    ) -> Option<PathBuf> {
        match self.write_failed_validation(source, index, errors, record).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(source = %source.display(), error = %err, "failed to quarantine invalid record");
                None
            }
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Temp file plus rename so readers never observe a half-written artifact.
async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), QuarantineError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| QuarantineError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let write_err = |source| QuarantineError::Write {
        path: temp_path.clone(),
        source,
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(write_err)?;
    file.write_all(bytes).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(QuarantineError::Write {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}
