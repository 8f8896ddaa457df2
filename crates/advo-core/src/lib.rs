//! Core advocate domain model, field cleaning rules and schema validation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "advo-core";

pub const ADVOCATE_FIELDS: [&str; 7] = [
    "user_id",
    "name",
    "email",
    "joined_at",
    "instagram_handle",
    "tiktok_handle",
    "advocacy_programs",
];

pub const PROGRAM_FIELDS: [&str; 4] = [
    "program_id",
    "brand",
    "total_sales_attributed",
    "tasks_completed",
];

pub const TASK_FIELDS: [&str; 7] = [
    "task_id",
    "platform",
    "post_url",
    "likes",
    "comments",
    "shares",
    "reach",
];

/// A single completed task within an advocacy program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub task_id: String,
    pub platform: String,
    pub post_url: String,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub reach: u64,
}

impl Task {
    pub fn engagement(&self) -> u64 {
        self.likes
            .saturating_add(self.comments)
            .saturating_add(self.shares)
    }
}

/// A brand program an advocate takes part in, with the tasks completed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub program_id: String,
    pub brand: String,
    pub total_sales_attributed: f64,
    #[serde(default)]
    pub tasks_completed: Vec<Task>,
}

/// Validated advocate record. Unknown top-level fields ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advocate {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instagram_handle: Option<String>,
    #[serde(default)]
    pub tiktok_handle: Option<String>,
    #[serde(default)]
    pub advocacy_programs: Vec<Program>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Advocate {
    pub fn total_sales(&self) -> f64 {
        self.advocacy_programs
            .iter()
            .map(|p| p.total_sales_attributed)
            .sum()
    }

    /// Saturates at `u64::MAX` rather than overflowing on extreme counters.
    pub fn total_engagement(&self) -> u64 {
        self.tasks()
            .map(Task::engagement)
            .fold(0u64, u64::saturating_add)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.advocacy_programs
            .iter()
            .flat_map(|p| p.tasks_completed.iter())
    }
}

/// Run-scoped ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub files_seen: u64,
    pub files_parsed: u64,
    pub files_skipped: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "files_seen={}, files_parsed={}, files_skipped={}, records_valid={}, records_invalid={}",
            self.files_seen,
            self.files_parsed,
            self.files_skipped,
            self.records_valid,
            self.records_invalid
        )
    }
}

static EMAIL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@]+@[^@]+\.[^@]+$").expect("email pattern is a valid regex")
});

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_SHAPE.is_match(value)
}

/// Lower-cased, trimmed email, or `None` when it does not look like `local@domain.tld`.
pub fn clean_email(value: Option<&JsonValue>) -> Option<String> {
    let text = value?.as_str()?;
    if !text.contains('@') {
        return None;
    }
    let normalized = text.trim().to_lowercase();
    is_valid_email(&normalized).then_some(normalized)
}

pub fn normalize_handle(value: &str) -> Option<String> {
    let filtered = value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '@'))
        .collect::<String>();
    if filtered.is_empty() {
        None
    } else if filtered.starts_with('@') {
        Some(filtered)
    } else {
        Some(format!("@{filtered}"))
    }
}

pub fn clean_handle(value: Option<&JsonValue>) -> Option<String> {
    normalize_handle(value?.as_str()?)
}

/// Parses ISO-8601 timestamps. A trailing `Z` is UTC; values without an offset are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    let offset_text = text.replace('Z', "+00:00");
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%:z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(&offset_text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn clean_date(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    parse_timestamp(value?.as_str()?)
}

/// Integer view of a JSON value: integers, integral strings, truncated floats, booleans.
pub fn parse_int_lenient(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        }),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn parse_float_lenient(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

pub fn clean_int(value: Option<&JsonValue>) -> i64 {
    value.and_then(parse_int_lenient).unwrap_or(0)
}

pub fn clean_float(value: Option<&JsonValue>) -> f64 {
    value.and_then(parse_float_lenient).unwrap_or(0.0)
}

pub const URL_SCHEMES: [&str; 2] = ["http", "https"];

/// Absolute http(s) URL with a non-empty host.
pub fn has_scheme_and_host(value: &str) -> bool {
    Url::parse(value)
        .map(|url| {
            URL_SCHEMES.contains(&url.scheme()) && url.host_str().is_some_and(|h| !h.is_empty())
        })
        .unwrap_or(false)
}

pub fn clean_url(value: Option<&JsonValue>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() || !has_scheme_and_host(text) {
        return None;
    }
    Some(text.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Missing,
    StringType,
    StringTooShort,
    IntParsing,
    FloatParsing,
    GreaterThanEqual,
    UrlParsing,
    EmailFormat,
    DatetimeParsing,
    ListType,
    ObjectType,
    ExtraForbidden,
}

impl Constraint {
    pub fn message(self) -> &'static str {
        match self {
            Constraint::Missing => "field required",
            Constraint::StringType => "input should be a valid string",
            Constraint::StringTooShort => "string should not be empty",
            Constraint::IntParsing => "input should be a valid integer",
            Constraint::FloatParsing => "input should be a valid finite number",
            Constraint::GreaterThanEqual => "input should be greater than or equal to 0",
            Constraint::UrlParsing => "input should be an absolute http(s) URL with a host",
            Constraint::EmailFormat => "input should be an email address",
            Constraint::DatetimeParsing => "input should be an ISO-8601 datetime",
            Constraint::ListType => "input should be a valid list",
            Constraint::ObjectType => "input should be a valid object",
            Constraint::ExtraForbidden => "extra inputs are not permitted",
        }
    }
}

/// One violated constraint at one field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub path: String,
    pub constraint: Constraint,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("record failed validation with {} violation(s)", .violations.len())]
pub struct ValidationErrors {
    pub violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    pub fn paths(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.path.as_str()).collect()
    }
}

#[derive(Debug, Default)]
struct Violations {
    items: Vec<FieldViolation>,
}

impl Violations {
    fn push(&mut self, path: String, constraint: Constraint, actual: Option<&JsonValue>) {
        self.items.push(FieldViolation {
            path,
            constraint,
            message: constraint.message().to_string(),
            actual: actual.cloned(),
        });
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn into_errors(self) -> ValidationErrors {
        ValidationErrors {
            violations: self.items,
        }
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

type JsonMap = serde_json::Map<String, JsonValue>;

fn reject_unknown(map: &JsonMap, known: &[&str], prefix: &str, v: &mut Violations) {
    for (key, value) in map {
        if !known.contains(&key.as_str()) {
            v.push(join_path(prefix, key), Constraint::ExtraForbidden, Some(value));
        }
    }
}

fn required_string(
    map: &JsonMap,
    prefix: &str,
    field: &str,
    non_empty: bool,
    v: &mut Violations,
) -> Option<String> {
    let path = join_path(prefix, field);
    match map.get(field) {
        None | Some(JsonValue::Null) => {
            v.push(path, Constraint::Missing, None);
            None
        }
        Some(JsonValue::String(s)) if non_empty && s.trim().is_empty() => {
            v.push(path, Constraint::StringTooShort, Some(&JsonValue::String(s.clone())));
            None
        }
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => {
            v.push(path, Constraint::StringType, Some(other));
            None
        }
    }
}

fn required_float(map: &JsonMap, prefix: &str, field: &str, v: &mut Violations) -> Option<f64> {
    let path = join_path(prefix, field);
    match map.get(field) {
        None => {
            v.push(path, Constraint::Missing, None);
            None
        }
        Some(value @ JsonValue::Bool(_)) => {
            v.push(path, Constraint::FloatParsing, Some(value));
            None
        }
        Some(value) => {
            let parsed = parse_float_lenient(value);
            if parsed.is_none() {
                v.push(path, Constraint::FloatParsing, Some(value));
            }
            parsed
        }
    }
}

fn strict_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn counter(map: &JsonMap, prefix: &str, field: &str, v: &mut Violations) -> Option<u64> {
    let Some(value) = map.get(field) else {
        return Some(0);
    };
    let path = join_path(prefix, field);
    match strict_int(value) {
        Some(n) if n >= 0 => Some(n as u64),
        Some(_) => {
            v.push(path, Constraint::GreaterThanEqual, Some(value));
            None
        }
        None => {
            v.push(path, Constraint::IntParsing, Some(value));
            None
        }
    }
}

fn validate_task(value: &JsonValue, path: &str, v: &mut Violations) -> Option<Task> {
    let Some(map) = value.as_object() else {
        v.push(path.to_string(), Constraint::ObjectType, Some(value));
        return None;
    };
    reject_unknown(map, &TASK_FIELDS, path, v);

    let task_id = required_string(map, path, "task_id", false, v);
    let platform = required_string(map, path, "platform", false, v);
    let post_url = required_string(map, path, "post_url", false, v).and_then(|url| {
        if has_scheme_and_host(&url) {
            Some(url)
        } else {
            v.push(
                join_path(path, "post_url"),
                Constraint::UrlParsing,
                Some(&JsonValue::String(url)),
            );
            None
        }
    });
    let likes = counter(map, path, "likes", v);
    let comments = counter(map, path, "comments", v);
    let shares = counter(map, path, "shares", v);
    let reach = counter(map, path, "reach", v);

    Some(Task {
        task_id: task_id?,
        platform: platform?,
        post_url: post_url?,
        likes: likes?,
        comments: comments?,
        shares: shares?,
        reach: reach?,
    })
}

fn validate_list<T>(
    map: &JsonMap,
    prefix: &str,
    field: &str,
    v: &mut Violations,
    mut item: impl FnMut(&JsonValue, &str, &mut Violations) -> Option<T>,
) -> Option<Vec<T>> {
    let path = join_path(prefix, field);
    match map.get(field) {
        None => Some(Vec::new()),
        Some(JsonValue::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            let mut complete = true;
            for (idx, value) in items.iter().enumerate() {
                match item(value, &format!("{path}[{idx}]"), v) {
                    Some(parsed) => out.push(parsed),
                    None => complete = false,
                }
            }
            complete.then_some(out)
        }
        Some(other) => {
            v.push(path, Constraint::ListType, Some(other));
            None
        }
    }
}

fn validate_program(value: &JsonValue, path: &str, v: &mut Violations) -> Option<Program> {
    let Some(map) = value.as_object() else {
        v.push(path.to_string(), Constraint::ObjectType, Some(value));
        return None;
    };
    reject_unknown(map, &PROGRAM_FIELDS, path, v);

    let program_id = required_string(map, path, "program_id", false, v);
    let brand = required_string(map, path, "brand", false, v);
    let total_sales_attributed = required_float(map, path, "total_sales_attributed", v);
    let tasks_completed = validate_list(map, path, "tasks_completed", v, validate_task);

    Some(Program {
        program_id: program_id?,
        brand: brand?,
        total_sales_attributed: total_sales_attributed?,
        tasks_completed: tasks_completed?,
    })
}

fn optional_email(map: &JsonMap, v: &mut Violations) -> Option<String> {
    match map.get("email") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) if is_valid_email(s) => Some(s.clone()),
        Some(value @ JsonValue::String(_)) => {
            v.push("email".into(), Constraint::EmailFormat, Some(value));
            None
        }
        Some(other) => {
            v.push("email".into(), Constraint::StringType, Some(other));
            None
        }
    }
}

fn optional_timestamp(map: &JsonMap, v: &mut Violations) -> Option<DateTime<Utc>> {
    match map.get("joined_at") {
        None | Some(JsonValue::Null) => None,
        Some(value) => {
            let parsed = value.as_str().and_then(parse_timestamp);
            if parsed.is_none() {
                v.push("joined_at".into(), Constraint::DatetimeParsing, Some(value));
            }
            parsed
        }
    }
}

fn optional_handle(map: &JsonMap, field: &str, v: &mut Violations) -> Option<String> {
    match map.get(field) {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => normalize_handle(s),
        Some(other) => {
            v.push(field.to_string(), Constraint::StringType, Some(other));
            None
        }
    }
}

/// Validates one cleaned record, reporting every violation rather than the first.
pub fn validate_advocate(record: &JsonValue) -> Result<Advocate, ValidationErrors> {
    let mut v = Violations::default();
    let Some(map) = record.as_object() else {
        v.push(String::new(), Constraint::ObjectType, Some(record));
        return Err(v.into_errors());
    };

    let user_id = required_string(map, "", "user_id", true, &mut v);
    let name = required_string(map, "", "name", true, &mut v);
    let email = optional_email(map, &mut v);
    let joined_at = optional_timestamp(map, &mut v);
    let instagram_handle = optional_handle(map, "instagram_handle", &mut v);
    let tiktok_handle = optional_handle(map, "tiktok_handle", &mut v);
    let advocacy_programs = validate_list(map, "", "advocacy_programs", &mut v, validate_program);

    let extra = map
        .iter()
        .filter(|(key, _)| !ADVOCATE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<BTreeMap<_, _>>();

    match (user_id, name, advocacy_programs) {
        (Some(user_id), Some(name), Some(advocacy_programs)) if v.is_empty() => Ok(Advocate {
            user_id,
            name,
            email,
            joined_at,
            instagram_handle,
            tiktok_handle,
            advocacy_programs,
            extra,
        }),
        _ => Err(v.into_errors()),
    }
}
