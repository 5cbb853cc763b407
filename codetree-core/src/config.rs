use crate::error::{CoreError, Result};
use codetree_scanner::{NexacroOptions, PortalSelectors, RecoveryPolicy, WalkerSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_DIR: &str = "~/.config/codetree";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LEDGER_FILE_NAME: &str = "ledger.db";
pub const DEFAULT_PORTAL_URL: &str = "https://biz.hira.or.kr/index.do";

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

pub fn default_config_dir() -> PathBuf {
    expand_path(DEFAULT_CONFIG_DIR)
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

pub fn default_ledger_path() -> PathBuf {
    default_config_dir().join(LEDGER_FILE_NAME)
}

/// Settings for a walk, read from `config.json`. Missing fields take their
/// defaults so a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    pub portal_url: String,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub stable_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub recovery_timeout_ms: u64,
    pub recovery_backoff_ms: u64,
    pub max_recoveries: u32,
    pub reopen_attempts: u32,
    pub element_retries: u32,
    pub extended_wait_factor: f64,
    /// Check the portal over plain HTTP before starting the browser.
    pub probe: bool,
    pub selectors: PortalSelectors,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            headless: true,
            chrome_executable: None,
            output_dir: PathBuf::from("downloads"),
            ledger_path: default_ledger_path(),
            stable_timeout_ms: 10_000,
            download_timeout_ms: 30_000,
            recovery_timeout_ms: 60_000,
            recovery_backoff_ms: 2_000,
            max_recoveries: 3,
            reopen_attempts: 3,
            element_retries: 2,
            extended_wait_factor: 3.0,
            probe: true,
            selectors: PortalSelectors::default(),
        }
    }
}

impl WalkConfig {
    /// Read the file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let mut config: WalkConfig = serde_json::from_str(&content)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.output_dir = expand_path(&self.output_dir.to_string_lossy());
        self.ledger_path = expand_path(&self.ledger_path.to_string_lossy());
        if let Some(chrome) = &self.chrome_executable {
            self.chrome_executable = Some(expand_path(&chrome.to_string_lossy()));
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.portal_url)
            .map_err(|e| CoreError::Config(format!("portal_url '{}': {}", self.portal_url, e)))?;
        if self.stable_timeout_ms == 0 || self.download_timeout_ms == 0 || self.recovery_timeout_ms == 0 {
            return Err(CoreError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.reopen_attempts == 0 {
            return Err(CoreError::Config("reopen_attempts must be at least 1".to_string()));
        }
        if !(self.extended_wait_factor >= 1.0) {
            return Err(CoreError::Config(format!(
                "extended_wait_factor must be >= 1.0 (got {})",
                self.extended_wait_factor
            )));
        }
        Ok(())
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_recoveries: self.max_recoveries,
            reopen_attempts: self.reopen_attempts,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            backoff: Duration::from_millis(self.recovery_backoff_ms),
            stable_timeout: Duration::from_millis(self.stable_timeout_ms),
        }
    }

    pub fn walker_settings(&self) -> WalkerSettings {
        WalkerSettings {
            stable_timeout: Duration::from_millis(self.stable_timeout_ms),
            download_timeout: Duration::from_millis(self.download_timeout_ms),
            element_retries: self.element_retries,
            extended_wait_factor: self.extended_wait_factor,
        }
    }

    pub fn nexacro_options(&self, download_dir: impl Into<PathBuf>) -> NexacroOptions {
        let mut options = NexacroOptions::new(download_dir);
        options.headless = self.headless;
        options.chrome_executable = self.chrome_executable.clone();
        options.selectors = self.selectors.clone();
        options.element_timeout = Duration::from_millis(self.stable_timeout_ms);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalkConfig::load(&temp_dir.path().join("nope.json")).unwrap();
        assert_eq!(config.portal_url, DEFAULT_PORTAL_URL);
        assert_eq!(config.max_recoveries, 3);
        assert!(config.probe);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"max_recoveries": 7, "headless": false}"#).unwrap();

        let config = WalkConfig::load(&path).unwrap();
        assert_eq!(config.max_recoveries, 7);
        assert!(!config.headless);
        assert_eq!(config.element_retries, 2);
        assert_eq!(config.selectors.major.row_prefix, PortalSelectors::default().major.row_prefix);
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");
        let config = WalkConfig {
            portal_url: "http://localhost:8080/popup.ndo".to_string(),
            output_dir: temp_dir.path().join("out"),
            ..WalkConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = WalkConfig::load(&path).unwrap();
        assert_eq!(loaded.portal_url, "http://localhost:8080/popup.ndo");
        assert_eq!(loaded.output_dir, temp_dir.path().join("out"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_url = WalkConfig {
            portal_url: "not a url".to_string(),
            ..WalkConfig::default()
        };
        assert!(matches!(bad_url.validate(), Err(CoreError::Config(_))));

        let bad_factor = WalkConfig {
            extended_wait_factor: 0.5,
            ..WalkConfig::default()
        };
        assert!(bad_factor.validate().is_err());

        let zero_timeout = WalkConfig {
            download_timeout_ms: 0,
            ..WalkConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(WalkConfig::load(&path), Err(CoreError::Json(_))));
    }

    #[test]
    fn test_conversions() {
        let config = WalkConfig {
            stable_timeout_ms: 1500,
            recovery_backoff_ms: 10,
            ..WalkConfig::default()
        };
        assert_eq!(config.walker_settings().stable_timeout, Duration::from_millis(1500));
        assert_eq!(config.recovery_policy().backoff, Duration::from_millis(10));
        assert_eq!(config.recovery_policy().stable_timeout, Duration::from_millis(1500));
        let options = config.nexacro_options("/tmp/dl");
        assert!(options.headless);
        assert_eq!(options.download_dir, PathBuf::from("/tmp/dl"));
    }
}
