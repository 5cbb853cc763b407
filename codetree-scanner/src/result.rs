use crate::error::ScanError;
use crate::tree::CategoryPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitStatus {
    Success,
    Failed,
    Skipped,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Success => "success",
            VisitStatus::Failed => "failed",
            VisitStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(VisitStatus::Success),
            "failed" => Some(VisitStatus::Failed),
            "skipped" => Some(VisitStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the adapter reports as downloaded, before it is moved into the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub suggested_name: Option<String>,
}

/// Final location of a leaf's artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub original_name: Option<String>,
}

/// Outcome of one leaf visit attempt, or of a failed branch.
///
/// Records are never mutated once built; a retry produces a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitRecord {
    pub path: CategoryPath,
    pub status: VisitStatus,
    pub artifact: Option<ArtifactRef>,
    pub timestamp: DateTime<Utc>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

impl VisitRecord {
    pub fn success(path: CategoryPath, artifact: ArtifactRef) -> Self {
        Self {
            path,
            status: VisitStatus::Success,
            artifact: Some(artifact),
            timestamp: Utc::now(),
            error_kind: None,
            error_detail: None,
        }
    }

    /// Pin the record to an instant taken earlier, such as the one an
    /// artifact was named after.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn skipped(path: CategoryPath) -> Self {
        Self {
            path,
            status: VisitStatus::Skipped,
            artifact: None,
            timestamp: Utc::now(),
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn failed(path: CategoryPath, error: &ScanError) -> Self {
        Self {
            path,
            status: VisitStatus::Failed,
            artifact: None,
            timestamp: Utc::now(),
            error_kind: Some(error.kind().to_string()),
            error_detail: Some(error.to_string()),
        }
    }

    pub fn key(&self) -> String {
        self.path.key()
    }

    pub fn is_leaf(&self) -> bool {
        self.path.is_leaf()
    }
}
