//! Ingest-side intake: directory scanning, two-stage JSON decoding and record cleaning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use advo_core::{
    clean_date, clean_email, clean_float, clean_handle, clean_int, clean_url, format_timestamp,
    ADVOCATE_FIELDS,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "advo-intake";

/// Resource-fork artifacts (`._user_1.json`) dropped by some archivers.
pub const JUNK_PREFIX: &str = "._";

pub const JSON_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("ingest directory does not exist or is not a directory: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("reading ingest directory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEntry {
    Candidate(PathBuf),
    Junk(PathBuf),
}

impl ScanEntry {
    pub fn path(&self) -> &Path {
        match self {
            ScanEntry::Candidate(path) | ScanEntry::Junk(path) => path,
        }
    }
}

/// Lazily walks the top level of an ingest directory, yielding `.json` entries.
#[derive(Debug)]
pub struct FileScanner {
    dir: PathBuf,
    entries: fs::ReadDir,
}

impl FileScanner {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ScanError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(ScanError::DirectoryNotFound(dir));
        }
        let entries = fs::read_dir(&dir).map_err(|source| ScanError::Read {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, entries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn has_json_extension(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(JSON_EXTENSION)
}

impl Iterator for FileScanner {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(dir = %self.dir.display(), error = %err, "failed reading directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !has_json_extension(&path) {
                continue;
            }
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let junk = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(JUNK_PREFIX));
            return Some(if junk {
                ScanEntry::Junk(path)
            } else {
                ScanEntry::Candidate(path)
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Strict,
    /// JSON5: trailing commas, unquoted keys, single quotes, comments.
    Permissive,
}

/// Tried in order; the first success wins.
pub const DECODE_STRATEGIES: [DecodeStrategy; 2] = [DecodeStrategy::Strict, DecodeStrategy::Permissive];

impl DecodeStrategy {
    pub fn name(self) -> &'static str {
        match self {
            DecodeStrategy::Strict => "strict",
            DecodeStrategy::Permissive => "permissive",
        }
    }

    pub fn decode(self, text: &str) -> Result<JsonValue, String> {
        match self {
            DecodeStrategy::Strict => serde_json::from_str(text).map_err(|e| e.to_string()),
            DecodeStrategy::Permissive => json5::from_str::<JsonValue>(text).map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeAttempt {
    pub strategy: DecodeStrategy,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("skipping non-text file {}", .path.display())]
    NotText { path: PathBuf },
    #[error("failed reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unparsable JSON in {} after {} attempt(s)", .path.display(), .attempts.len())]
    Unparsable {
        path: PathBuf,
        text: String,
        attempts: Vec<DecodeAttempt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFile {
    pub path: PathBuf,
    pub value: JsonValue,
    pub strategy: DecodeStrategy,
}

pub fn decode_text(text: &str) -> Result<(JsonValue, DecodeStrategy), Vec<DecodeAttempt>> {
    let mut attempts = Vec::with_capacity(DECODE_STRATEGIES.len());
    for strategy in DECODE_STRATEGIES {
        match strategy.decode(text) {
            Ok(value) => return Ok((value, strategy)),
            Err(error) => attempts.push(DecodeAttempt { strategy, error }),
        }
    }
    Err(attempts)
}

pub async fn decode_file(path: &Path) -> Result<DecodedFile, DecodeError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| DecodeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| DecodeError::NotText {
        path: path.to_path_buf(),
    })?;

    match decode_text(&text) {
        Ok((value, strategy)) => {
            if strategy != DecodeStrategy::Strict {
                debug!(path = %path.display(), strategy = strategy.name(), "decoded with fallback parser");
            }
            Ok(DecodedFile {
                path: path.to_path_buf(),
                value,
                strategy,
            })
        }
        Err(attempts) => Err(DecodeError::Unparsable {
            path: path.to_path_buf(),
            text,
            attempts,
        }),
    }
}

/// A decoded file holds either one record or a list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(JsonValue),
    Many(Vec<JsonValue>),
}

impl From<JsonValue> for Payload {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => Payload::Many(items),
            other => Payload::Single(other),
        }
    }
}

impl Payload {
    /// Candidates in source order, tagged with their list index when the file held a list.
    pub fn into_candidates(self) -> Vec<(Option<usize>, JsonValue)> {
        match self {
            Payload::Single(value) => vec![(None, value)],
            Payload::Many(items) => items
                .into_iter()
                .enumerate()
                .map(|(idx, value)| (Some(idx), value))
                .collect(),
        }
    }
}

fn optional_string(value: Option<String>) -> JsonValue {
    value.map(JsonValue::String).unwrap_or(JsonValue::Null)
}

fn passthrough(map: &Map<String, JsonValue>, field: &str) -> JsonValue {
    map.get(field).cloned().unwrap_or(JsonValue::Null)
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

fn clean_list(value: Option<&JsonValue>, clean_item: fn(&JsonValue) -> JsonValue) -> JsonValue {
    match value {
        None | Some(JsonValue::Null) => JsonValue::Array(Vec::new()),
        Some(JsonValue::Array(items)) => JsonValue::Array(items.iter().map(clean_item).collect()),
        Some(other) => other.clone(),
    }
}

fn clean_task(value: &JsonValue) -> JsonValue {
    let Some(task) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::new();
    out.insert("task_id".into(), passthrough(task, "task_id"));
    out.insert("platform".into(), passthrough(task, "platform"));
    out.insert("post_url".into(), optional_string(clean_url(task.get("post_url"))));
    for counter in ["likes", "comments", "shares", "reach"] {
        out.insert(counter.into(), JsonValue::from(clean_int(task.get(counter))));
    }
    JsonValue::Object(out)
}

fn clean_program(value: &JsonValue) -> JsonValue {
    let Some(program) = value.as_object() else {
        return value.clone();
    };
    let program_id = program
        .get("program_id")
        .filter(|v| !is_falsy(v))
        .cloned()
        .unwrap_or(JsonValue::Null);
    let brand = match program.get("brand") {
        None | Some(JsonValue::Null) => JsonValue::Null,
        Some(JsonValue::String(s)) => JsonValue::String(s.clone()),
        Some(other) => JsonValue::String(other.to_string()),
    };

    let mut out = Map::new();
    out.insert("program_id".into(), program_id);
    out.insert("brand".into(), brand);
    out.insert(
        "total_sales_attributed".into(),
        JsonValue::from(clean_float(program.get("total_sales_attributed"))),
    );
    out.insert(
        "tasks_completed".into(),
        clean_list(program.get("tasks_completed"), clean_task),
    );
    JsonValue::Object(out)
}

/// Normalizes one raw advocate object. Never fails; unknown top-level keys are carried through.
pub fn clean_advocate(raw: &Map<String, JsonValue>) -> JsonValue {
    let mut out = Map::new();
    out.insert("user_id".into(), passthrough(raw, "user_id"));
    out.insert("name".into(), passthrough(raw, "name"));
    out.insert("email".into(), optional_string(clean_email(raw.get("email"))));
    out.insert(
        "instagram_handle".into(),
        optional_string(clean_handle(raw.get("instagram_handle"))),
    );
    out.insert(
        "tiktok_handle".into(),
        optional_string(clean_handle(raw.get("tiktok_handle"))),
    );
    out.insert(
        "joined_at".into(),
        optional_string(clean_date(raw.get("joined_at")).map(|dt| format_timestamp(&dt))),
    );
    out.insert(
        "advocacy_programs".into(),
        clean_list(raw.get("advocacy_programs"), clean_program),
    );

    for (key, value) in raw {
        if !ADVOCATE_FIELDS.contains(&key.as_str()) {
            out.insert(key.clone(), value.clone());
        }
    }
    JsonValue::Object(out)
}
