use crate::error::{Result, ScanError};
use crate::result::{ArtifactRef, DownloadedFile};
use crate::tree::CategoryPath;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

fn sanitize(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// `{path}_{timestamp}[_{original}]`, with path segments joined by `_` and
/// the timestamp written in UTC.
pub fn artifact_file_name(
    path: &CategoryPath,
    timestamp: DateTime<Utc>,
    original_name: Option<&str>,
) -> String {
    let stem = path
        .nodes()
        .iter()
        .map(|n| sanitize(&n.key_segment()))
        .collect::<Vec<_>>()
        .join("_");

    let mut name = format!("{}_{}", stem, timestamp.format(TIMESTAMP_FORMAT));
    if let Some(original) = original_name.map(sanitize).filter(|o| !o.is_empty()) {
        name.push('_');
        name.push_str(&original);
    }
    name
}

/// First free variant of `candidate`: `name.ext`, `name_2.ext`, `name_3.ext`, ...
fn unique_target(dir: &Path, candidate: &str) -> PathBuf {
    let first = dir.join(candidate);
    if !first.exists() {
        return first;
    }

    let as_path = Path::new(candidate);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| candidate.to_string());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 2;
    loop {
        let next = dir.join(format!("{}_{}{}", stem, n, extension));
        if !next.exists() {
            return next;
        }
        n += 1;
    }
}

/// Moves downloaded files into the output directory under their final names.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Move `file` into place, naming it after `path` and the `stored_at` instant.
    pub async fn store(
        &self,
        path: &CategoryPath,
        file: DownloadedFile,
        stored_at: DateTime<Utc>,
    ) -> Result<ArtifactRef> {
        let original_name = file.suggested_name.clone().or_else(|| {
            file.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        });

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| {
                ScanError::DownloadFailed(format!(
                    "cannot create {}: {}",
                    self.output_dir.display(),
                    e
                ))
            })?;

        let name = artifact_file_name(path, stored_at, original_name.as_deref());
        let target = unique_target(&self.output_dir, &name);

        if tokio::fs::rename(&file.path, &target).await.is_err() {
            // rename fails across filesystems; fall back to copy + remove
            tokio::fs::copy(&file.path, &target).await.map_err(|e| {
                ScanError::DownloadFailed(format!(
                    "cannot move {} to {}: {}",
                    file.path.display(),
                    target.display(),
                    e
                ))
            })?;
            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                debug!("Leaving downloaded file {} in place: {}", file.path.display(), e);
            }
        }

        debug!("Stored artifact for '{}' at {}", path, target.display());
        Ok(ArtifactRef {
            path: target,
            original_name,
        })
    }
}
