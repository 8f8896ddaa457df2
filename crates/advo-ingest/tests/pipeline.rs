use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use advo_core::{Advocate, IngestStats};
use advo_ingest::{run_ingest, IngestConfig, IngestPipeline, RunPhase};
use advo_storage::{
    AdvocateStore, BrandPerformance, FailedValidationRecord, MemoryAdvocateStore, MetricValue,
    OutlierMetric, QuarantineWriter, StoreError, TopMetric,
};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

#[derive(Default)]
struct RecordingStore {
    inner: MemoryAdvocateStore,
    batch_sizes: Mutex<Vec<usize>>,
}

impl RecordingStore {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdvocateStore for RecordingStore {
    async fn add_advocates(&self, batch: &[Advocate]) -> Result<(), StoreError> {
        self.batch_sizes.lock().unwrap().push(batch.len());
        self.inner.add_advocates(batch).await
    }

    async fn get_advocate(&self, user_id: &str) -> Result<Option<Advocate>, StoreError> {
        self.inner.get_advocate(user_id).await
    }

    async fn top_advocates(&self, metric: TopMetric, limit: usize) -> Result<Vec<MetricValue>, StoreError> {
        self.inner.top_advocates(metric, limit).await
    }

    async fn brand_performance(&self) -> Result<Vec<BrandPerformance>, StoreError> {
        self.inner.brand_performance().await
    }

    async fn outliers(&self, metric: OutlierMetric, stddev: f64) -> Result<Vec<MetricValue>, StoreError> {
        self.inner.outliers(metric, stddev).await
    }
}

struct UnavailableStore;

#[async_trait]
impl AdvocateStore for UnavailableStore {
    async fn add_advocates(&self, _batch: &[Advocate]) -> Result<(), StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn get_advocate(&self, _user_id: &str) -> Result<Option<Advocate>, StoreError> {
        Ok(None)
    }

    async fn top_advocates(&self, _metric: TopMetric, _limit: usize) -> Result<Vec<MetricValue>, StoreError> {
        Ok(Vec::new())
    }

    async fn brand_performance(&self) -> Result<Vec<BrandPerformance>, StoreError> {
        Ok(Vec::new())
    }

    async fn outliers(&self, _metric: OutlierMetric, _stddev: f64) -> Result<Vec<MetricValue>, StoreError> {
        Ok(Vec::new())
    }
}

fn advocate(user_id: &str) -> JsonValue {
    json!({
        "user_id": user_id,
        "name": format!("Advocate {user_id}"),
        "joined_at": "2024-02-01T12:00:00Z",
        "advocacy_programs": [{
            "program_id": "p-1",
            "brand": "Acme",
            "total_sales_attributed": 10.0,
            "tasks_completed": [{
                "task_id": "t-1",
                "platform": "Instagram",
                "post_url": "https://instagram.com/p/1",
                "likes": 5,
                "comments": 1,
                "shares": 1,
                "reach": 100
            }]
        }]
    })
}

fn ingest_dir(root: &Path) -> PathBuf {
    let dir = root.join("raw_data");
    std::fs::create_dir(&dir).unwrap();
    dir
}

fn write_json(dir: &Path, name: &str, value: &JsonValue) {
    std::fs::write(dir.join(name), serde_json::to_vec(value).unwrap()).unwrap();
}

fn config(dir: &Path) -> IngestConfig {
    IngestConfig {
        ingest_dir: dir.to_path_buf(),
        max_workers: 3,
        batch_size: 500,
        dry_run: false,
    }
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn good_and_malformed_files_are_counted_and_quarantined() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    for n in 0..5 {
        write_json(&dir, &format!("good_{n}.json"), &advocate(&format!("u{n}")));
    }
    std::fs::write(dir.join("broken_a.json"), "{\"user_id\": ").unwrap();
    std::fs::write(dir.join("broken_b.json"), "<<< not json >>>").unwrap();

    let store = Arc::new(MemoryAdvocateStore::new());
    let summary = run_ingest(config(&dir), Some(store.clone())).await;

    assert_eq!(
        summary.stats,
        IngestStats {
            files_seen: 7,
            files_parsed: 5,
            files_skipped: 2,
            records_valid: 5,
            records_invalid: 0,
        }
    );
    assert_eq!(store.len().await, 5);

    let quarantine = QuarantineWriter::for_ingest_dir(&dir);
    assert_eq!(count_entries(quarantine.invalid_json_dir()), 2);
    let raw = std::fs::read_to_string(quarantine.invalid_json_path(&dir.join("broken_b.json"))).unwrap();
    assert_eq!(serde_json::from_str::<String>(&raw).unwrap(), "<<< not json >>>");
    assert_eq!(count_entries(quarantine.failed_validation_dir()), 0);
}

#[tokio::test]
async fn each_invalid_list_item_gets_its_own_artifact() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    let list = json!([
        advocate("ok-0"),
        {"name": "missing id"},
        advocate("ok-2"),
        {"user_id": "bad-3", "name": "Bad Counter", "advocacy_programs": [{
            "program_id": "p", "brand": "Acme", "total_sales_attributed": 1,
            "tasks_completed": [{"task_id": "t", "platform": "x", "post_url": "nope"}]
        }]}
    ]);
    write_json(&dir, "export.json", &list);

    let store = Arc::new(MemoryAdvocateStore::new());
    let stats = IngestPipeline::new(config(&dir)).with_store(store.clone()).run().await;

    assert_eq!(stats.files_parsed, 1);
    assert_eq!(stats.records_valid, 2);
    assert_eq!(stats.records_invalid, 2);

    let quarantine = QuarantineWriter::for_ingest_dir(&dir);
    let source = dir.join("export.json");
    assert!(!quarantine.failed_validation_path(&source, Some(0)).exists());
    for idx in [1, 3] {
        let raw = std::fs::read(quarantine.failed_validation_path(&source, Some(idx))).unwrap();
        let artifact: FailedValidationRecord = serde_json::from_slice(&raw).unwrap();
        assert!(artifact.source_file.ends_with("export.json"));
        assert!(!artifact.validation_errors.is_empty());
    }

    let raw = std::fs::read(quarantine.failed_validation_path(&source, Some(3))).unwrap();
    let artifact: FailedValidationRecord = serde_json::from_slice(&raw).unwrap();
    assert_eq!(artifact.record["user_id"], "bad-3");
    assert!(artifact
        .validation_errors
        .iter()
        .any(|v| v.path == "advocacy_programs[0].tasks_completed[0].post_url"));
}

#[tokio::test]
async fn list_and_single_file_artifacts_never_share_a_name() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    write_json(&dir, "batch.json", &json!([advocate("ok"), {"name": "no id A"}]));
    write_json(&dir, "batch_1.json", &json!({"name": "no id B"}));

    let stats = run_ingest(config(&dir), None).await.stats;
    assert_eq!(stats.records_invalid, 2);

    let quarantine = QuarantineWriter::for_ingest_dir(&dir);
    assert_eq!(count_entries(quarantine.failed_validation_dir()), 2);
    for (source, index, name) in [("batch.json", Some(1), "no id A"), ("batch_1.json", None, "no id B")] {
        let raw = std::fs::read(quarantine.failed_validation_path(&dir.join(source), index)).unwrap();
        let artifact: FailedValidationRecord = serde_json::from_slice(&raw).unwrap();
        assert!(artifact.source_file.ends_with(source));
        assert_eq!(artifact.record["name"], name);
    }
}

#[tokio::test]
async fn batches_flush_at_threshold_and_once_more_at_the_end() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    for n in 0..7 {
        write_json(&dir, &format!("adv_{n}.json"), &advocate(&format!("u{n}")));
    }

    let store = Arc::new(RecordingStore::default());
    let summary = run_ingest(
        IngestConfig {
            batch_size: 3,
            max_workers: 2,
            ..config(&dir)
        },
        Some(store.clone()),
    )
    .await;

    assert_eq!(store.batch_sizes(), vec![3, 3, 1]);
    assert_eq!(summary.batches_flushed, 3);
    assert_eq!(summary.records_flushed as u64, summary.stats.records_valid);
    assert_eq!(store.inner.len().await, 7);
}

#[tokio::test]
async fn batch_never_exceeds_threshold_with_multi_record_files() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    write_json(&dir, "a.json", &json!([advocate("a0"), advocate("a1"), advocate("a2"), advocate("a3")]));
    write_json(&dir, "b.json", &json!([advocate("b0"), advocate("b1"), advocate("b2")]));

    let store = Arc::new(RecordingStore::default());
    run_ingest(
        IngestConfig {
            batch_size: 2,
            ..config(&dir)
        },
        Some(store.clone()),
    )
    .await;

    let sizes = store.batch_sizes();
    assert!(sizes.iter().all(|size| *size <= 2));
    assert_eq!(sizes.iter().sum::<usize>(), 7);
}

#[tokio::test]
async fn dry_run_collects_records_and_repeats_identically() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    write_json(&dir, "one.json", &advocate("u1"));
    write_json(&dir, "many.json", &json!([advocate("u2"), {"name": "nobody"}]));

    let store = Arc::new(MemoryAdvocateStore::new());
    let mut pipeline = IngestPipeline::new(IngestConfig {
        dry_run: true,
        ..config(&dir)
    })
    .with_store(store.clone());

    let first = pipeline.run_with_summary().await;
    assert!(first.dry_run);
    assert_eq!(first.batches_flushed, 0);
    assert_eq!(pipeline.advocates().len(), 2);
    assert!(store.is_empty().await);

    let second = pipeline.run().await;
    assert_eq!(first.stats, second);
    assert_eq!(pipeline.advocates().len(), 2);
    assert_eq!(pipeline.phase(), RunPhase::Done);

    let mut ids: Vec<_> = pipeline.into_advocates().into_iter().map(|a| a.user_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["u1", "u2"]);
}

#[tokio::test]
async fn junk_and_binary_files_are_skipped_without_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    write_json(&dir, "real.json", &advocate("u1"));
    write_json(&dir, "._real.json", &advocate("shadow"));
    std::fs::write(dir.join("blob.json"), [0xff, 0xfe, 0x00, 0x81]).unwrap();
    std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
    std::fs::create_dir(dir.join("nested.json")).unwrap();

    let stats = run_ingest(config(&dir), None).await.stats;

    assert_eq!(
        stats,
        IngestStats {
            files_seen: 3,
            files_parsed: 1,
            files_skipped: 2,
            records_valid: 1,
            records_invalid: 0,
        }
    );
    let quarantine = QuarantineWriter::for_ingest_dir(&dir);
    assert!(!quarantine.invalid_json_dir().exists());
}

#[tokio::test]
async fn missing_and_empty_directories_report_zero_stats() {
    let root = tempfile::tempdir().unwrap();

    let missing = run_ingest(config(&root.path().join("nope")), None).await;
    assert!(!missing.directory_found);
    assert_eq!(missing.stats, IngestStats::default());

    let empty = run_ingest(config(&ingest_dir(root.path())), None).await;
    assert!(empty.directory_found);
    assert_eq!(empty.stats, IngestStats::default());
}

#[tokio::test]
async fn sink_failures_are_counted_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    for n in 0..4 {
        write_json(&dir, &format!("adv_{n}.json"), &advocate(&format!("u{n}")));
    }

    let summary = run_ingest(
        IngestConfig {
            batch_size: 2,
            ..config(&dir)
        },
        Some(Arc::new(UnavailableStore)),
    )
    .await;

    assert_eq!(summary.stats.records_valid, 4);
    assert_eq!(summary.flush_failures, 2);
    assert_eq!(summary.batches_flushed, 0);
}

#[tokio::test]
async fn fixture_exports_ingest_end_to_end() {
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/advocates");
    let root = tempfile::tempdir().unwrap();
    let dir = ingest_dir(root.path());
    for entry in std::fs::read_dir(&fixtures).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), dir.join(entry.file_name())).unwrap();
    }

    let store = Arc::new(MemoryAdvocateStore::new());
    let summary = run_ingest(config(&dir), Some(store.clone())).await;
    assert_eq!(
        summary.stats,
        IngestStats {
            files_seen: 4,
            files_parsed: 3,
            files_skipped: 1,
            records_valid: 4,
            records_invalid: 1,
        }
    );

    let alice = store.get_advocate("a1f0c2de-0001").await.unwrap().unwrap();
    assert_eq!(alice.email.as_deref(), Some("alice.moreau@example.com"));
    assert_eq!(alice.instagram_handle.as_deref(), Some("@alice__m"));
    assert_eq!(alice.tiktok_handle, None);
    assert_eq!(alice.total_sales(), 1250.5);
    let task = alice.tasks().next().unwrap();
    assert_eq!((task.likes, task.comments, task.shares), (320, 41, 0));

    let chen = store.get_advocate("b2-0003").await.unwrap().unwrap();
    assert_eq!(chen.email, None);
    assert!(chen.advocacy_programs.is_empty());

    let dana = store.get_advocate("legacy-0042").await.unwrap().unwrap();
    assert_eq!(
        dana.joined_at.map(|dt| dt.to_rfc3339()),
        Some("2021-06-30T00:00:00+00:00".to_string())
    );

    let quarantine = QuarantineWriter::for_ingest_dir(&dir);
    assert!(quarantine.invalid_json_path(&dir.join("truncated.json")).exists());
    assert!(quarantine
        .failed_validation_path(&dir.join("batch_export.json"), Some(1))
        .exists());
}
