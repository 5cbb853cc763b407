use crate::error::{Result, ScanError};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Plain HTTP check that the portal answers before a browser is started.
pub struct ReachabilityProbe {
    client: Client,
}

impl ReachabilityProbe {
    pub fn new() -> Result<Self> {
        Self::with_timeout(10)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("codetree/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.div_ceil(2)))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    /// Returns the HTTP status when the portal answered. Transport errors and
    /// server errors mean the classification root cannot be reached.
    pub async fn check(&self, portal_url: &str) -> Result<u16> {
        let url = Url::parse(portal_url)
            .map_err(|e| ScanError::RootUnreachable(format!("invalid portal URL '{}': {}", portal_url, e)))?;

        debug!("Probing {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ScanError::RootUnreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ScanError::RootUnreachable(format!(
                "{} answered {}",
                url, status
            )));
        }

        info!("Portal reachable ({})", status.as_u16());
        Ok(status.as_u16())
    }
}
