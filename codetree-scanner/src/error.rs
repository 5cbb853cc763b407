use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timed out after {}ms waiting for {what}", after.as_millis())]
    TimeoutExceeded { what: String, after: Duration },

    #[error("Session lost: {0}")]
    SessionLost(String),

    /// The session died and was rebuilt at the classification root. Any
    /// position held in the tree is gone and must be re-established.
    #[error("Session recovered after: {0}")]
    Recovered(String),

    #[error("Session unrecoverable after {attempts} attempt(s): {last_error}")]
    SessionUnrecoverable { attempts: u32, last_error: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("path not found after recovery: {0}")]
    PathNotFoundAfterRecovery(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Classification root unreachable: {0}")]
    RootUnreachable(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        ScanError::TimeoutExceeded {
            what: what.into(),
            after,
        }
    }

    /// Stable tag stored alongside failed visits.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::ElementNotFound(_) => "element_not_found",
            ScanError::TimeoutExceeded { .. } => "timeout_exceeded",
            ScanError::SessionLost(_) => "session_lost",
            ScanError::Recovered(_) => "recovered",
            ScanError::SessionUnrecoverable { .. } => "session_unrecoverable",
            ScanError::DownloadFailed(_) => "download_failed",
            ScanError::PathNotFoundAfterRecovery(_) => "path_not_found_after_recovery",
            ScanError::PathNotFound(_) => "path_not_found",
            ScanError::RootUnreachable(_) => "root_unreachable",
            ScanError::InvalidPath(_) => "invalid_path",
            ScanError::Browser(_) => "browser",
            ScanError::HttpError(_) => "http",
            ScanError::IoError(_) => "io",
            ScanError::Other(_) => "other",
        }
    }

    pub fn is_session_loss(&self) -> bool {
        matches!(self, ScanError::SessionLost(_))
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, ScanError::Recovered(_))
    }

    /// Errors that end the whole run rather than a single leaf or branch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::RootUnreachable(_) | ScanError::PathNotFound(_) | ScanError::InvalidPath(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_snake_case() {
        let errors = [
            ScanError::ElementNotFound("x".into()),
            ScanError::timeout("grid", Duration::from_millis(10)),
            ScanError::SessionLost("closed".into()),
            ScanError::DownloadFailed("disk".into()),
            ScanError::PathNotFoundAfterRecovery("A > B".into()),
        ];
        for error in errors {
            let kind = error.kind();
            assert!(kind.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{kind}");
        }
    }

    #[test]
    fn test_path_not_found_after_recovery_message() {
        let error = ScanError::PathNotFoundAfterRecovery("M1 > S1".into());
        assert_eq!(error.to_string(), "path not found after recovery: M1 > S1");
    }

    #[test]
    fn test_timeout_message_includes_millis() {
        let error = ScanError::timeout("download", Duration::from_millis(1500));
        assert_eq!(error.to_string(), "Timed out after 1500ms waiting for download");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ScanError::RootUnreachable("no".into()).is_fatal());
        assert!(!ScanError::ElementNotFound("row".into()).is_fatal());
        assert!(!ScanError::Recovered("lost".into()).is_fatal());
    }
}
