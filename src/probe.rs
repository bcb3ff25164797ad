//! Collaborator seams consumed by diagnostics.
//!
//! The core never talks to the backend or the local store itself. Applications
//! inject a [`ReachabilityProbe`] for connectivity checks and, optionally, a
//! [`RecordSource`] whose snapshot is scanned for structural corruption.

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Fields treated as timestamps when scanning records.
pub const TIMESTAMP_FIELDS: &[&str] = &["lastModified", "createdAt", "updatedAt", "timestamp"];

/// String values that indicate a serialization bug upstream.
const PLACEHOLDER_VALUES: &[&str] = &["undefined", "NaN", "[object Object]"];

/// Result of a reachability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeReport {
    pub fn reachable(latency_ms: u64) -> Self {
        Self {
            reachable: true,
            latency_ms: Some(latency_ms),
            detail: None,
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            detail: Some(detail.into()),
        }
    }
}

/// Connectivity/latency check against the remote backend.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Probe the remote. An `Err` means the probe itself could not run.
    async fn probe(&self) -> anyhow::Result<ProbeReport>;

    /// Name shown in diagnostic checks
    fn name(&self) -> &str {
        "remote"
    }
}

/// A named set of records as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCollection {
    pub name: String,
    pub records: Vec<Value>,
}

impl RecordCollection {
    pub fn new(name: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

/// Read-only snapshot of local records, scanned by the corruption phase.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Vec<RecordCollection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordIssueKind {
    NotAnObject,
    MissingId,
    DuplicateId,
    InvalidTimestamp,
    PlaceholderValue,
    NullField,
}

impl RecordIssueKind {
    /// Null fields are tolerated by the store; everything else is corruption.
    pub fn is_corruption(self) -> bool {
        !matches!(self, RecordIssueKind::NullField)
    }
}

/// One structural problem found in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub kind: RecordIssueKind,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

fn record_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamps may be epoch millis or RFC 3339 strings. Both forms must parse.
pub fn is_valid_timestamp(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|v| v.is_finite() && v >= 0.0),
        Value::String(s) => {
            DateTime::parse_from_rfc3339(s).is_ok()
                || s.parse::<f64>().is_ok_and(|v| v.is_finite() && v >= 0.0)
        }
        _ => false,
    }
}

/// Scan `records` for structural problems.
pub fn check_records(records: &[Value]) -> Vec<RecordIssue> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        let Some(fields) = record.as_object() else {
            issues.push(RecordIssue {
                kind: RecordIssueKind::NotAnObject,
                index,
                id: None,
                field: None,
            });
            continue;
        };

        let id = fields.get("id").and_then(record_id);
        let issue = |kind, field: Option<&str>| RecordIssue {
            kind,
            index,
            id: id.clone(),
            field: field.map(str::to_string),
        };

        match &id {
            None => issues.push(issue(RecordIssueKind::MissingId, Some("id"))),
            Some(id) if !seen.insert(id.clone()) => {
                issues.push(issue(RecordIssueKind::DuplicateId, Some("id")))
            }
            Some(_) => {}
        }

        for (name, value) in fields {
            if name == "id" {
                continue;
            }
            let field = Some(name.as_str());
            if TIMESTAMP_FIELDS.contains(&name.as_str())
                && !value.is_null()
                && !is_valid_timestamp(value)
            {
                issues.push(issue(RecordIssueKind::InvalidTimestamp, field));
                continue;
            }
            match value {
                Value::Null => issues.push(issue(RecordIssueKind::NullField, field)),
                Value::String(s) if PLACEHOLDER_VALUES.contains(&s.as_str()) => {
                    issues.push(issue(RecordIssueKind::PlaceholderValue, field))
                }
                _ => {}
            }
        }
    }

    issues
}
