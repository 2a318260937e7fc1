//! Core domain model for the btpi reporting server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "btpi-core";

/// One configured reporting query and its output destination.
///
/// Field names serialize in PascalCase to match the `queries.json` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryDefinition {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "SQL")]
    pub sql: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub last_modified: String,
    #[serde(default)]
    pub error: String,
}

impl QueryDefinition {
    pub fn has_output(&self) -> bool {
        !self.file.is_empty()
    }

    pub fn apply(&mut self, change: &StatusChange) {
        match change {
            StatusChange::Succeeded { last_modified } => {
                self.last_modified = last_modified.clone();
                self.error.clear();
            }
            StatusChange::Failed { error } => {
                self.error = error.clone();
            }
        }
    }
}

/// Published, root-relative description of one produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    pub name: String,
    pub title: String,
    pub file: String,
}

/// Shape the proxy expects back from the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Xml,
    Json,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Xml => "xml",
            ResponseFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusChange {
    Succeeded { last_modified: String },
    Failed { error: String },
}

/// Status change for a single query, keyed by `Name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryUpdate {
    pub name: String,
    pub change: StatusChange,
}

/// Result of one batch. The caller merges `updates` into its own query list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: bool,
    pub started_at: String,
    pub updates: Vec<QueryUpdate>,
    pub manifest: Vec<ManifestEntry>,
}

impl BatchOutcome {
    pub fn failed(started_at: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            started_at: started_at.into(),
            updates: Vec::new(),
            manifest: Vec::new(),
        }
    }

    pub fn update_for(&self, name: &str) -> Option<&StatusChange> {
        self.updates
            .iter()
            .rev()
            .find(|u| u.name == name)
            .map(|u| &u.change)
    }
}

/// Formats a timestamp as an HTTP-date (`Sun, 18 Oct 2026 12:30:00 GMT`),
/// usable verbatim as a `Last-Modified` header value.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
