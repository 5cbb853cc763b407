use crate::adapter::UiAdapter;
use crate::error::{Result, ScanError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Recovering,
    Unrecoverable,
}

/// One loss-and-recovery episode, kept for post-run diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub scope: String,
    pub cause: String,
    pub attempts: u32,
    pub recovered: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Successful recoveries allowed while working on a single node or leaf.
    pub max_recoveries: u32,
    /// Reopen attempts made for one recovery before giving up.
    pub reopen_attempts: u32,
    pub recovery_timeout: Duration,
    pub backoff: Duration,
    pub stable_timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_recoveries: 3,
            reopen_attempts: 3,
            recovery_timeout: Duration::from_secs(60),
            backoff: Duration::from_secs(2),
            stable_timeout: Duration::from_secs(10),
        }
    }
}

/// Sole owner of the live UI session.
///
/// Every interaction goes through [`SessionManager::with_session`]. When the
/// session is found dead the handle is rebuilt at the classification root and
/// the caller receives [`ScanError::Recovered`], telling it that any tree
/// position it held is gone.
pub struct SessionManager {
    adapter: Box<dyn UiAdapter>,
    policy: RecoveryPolicy,
    state: SessionState,
    scope: String,
    scope_recoveries: u32,
    restored: bool,
    events: Vec<RecoveryEvent>,
}

impl SessionManager {
    pub fn new(adapter: Box<dyn UiAdapter>) -> Self {
        Self {
            adapter,
            policy: RecoveryPolicy::default(),
            state: SessionState::Connected,
            scope: String::new(),
            scope_recoveries: 0,
            restored: true,
            events: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn recoveries(&self) -> &[RecoveryEvent] {
        &self.events
    }

    pub fn download_leaves_tree(&self) -> bool {
        self.adapter.download_leaves_tree()
    }

    /// Open the portal at the classification root. Failure here ends the run.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Opening classification root");
        let stable = self.policy.stable_timeout;
        let adapter = self.adapter.as_mut();
        let opened = async {
            adapter.open_root().await?;
            adapter.wait_stable(stable).await
        };
        match tokio::time::timeout(self.policy.recovery_timeout, opened).await {
            Ok(Ok(())) => {
                self.state = SessionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => Err(ScanError::RootUnreachable(e.to_string())),
            Err(_) => Err(ScanError::RootUnreachable(
                ScanError::timeout("classification root", self.policy.recovery_timeout).to_string(),
            )),
        }
    }

    /// Start a new unit of work. The recovery budget is reset only when the
    /// scope actually changes, so retries of the same unit share one budget.
    pub fn begin_scope(&mut self, scope: &str) {
        if self.scope == scope {
            return;
        }
        self.scope = scope.to_string();
        self.scope_recoveries = 0;
        if self.state == SessionState::Unrecoverable && self.restored {
            self.state = SessionState::Connected;
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Run one interaction against the live session.
    ///
    /// Returns the operation's own error when the session is still alive,
    /// `Recovered` after a successful rebuild, and `SessionUnrecoverable` once
    /// the scope's budget is spent or the rebuild itself fails.
    pub async fn with_session<T, F>(&mut self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn UiAdapter) -> BoxFuture<'a, Result<T>>,
    {
        if !self.restored {
            // A previous scope left the session dead; try once more before
            // touching the UI for this one.
            match self.restore().await {
                Ok(_) => {
                    self.restored = true;
                    self.scope_recoveries += 1;
                    self.state = SessionState::Connected;
                    return Err(ScanError::Recovered(
                        "session restored at classification root".to_string(),
                    ));
                }
                Err((attempts, last_error)) => {
                    return Err(ScanError::SessionUnrecoverable {
                        attempts,
                        last_error,
                    });
                }
            }
        }

        let error = match op(self.adapter.as_mut()).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let lost = error.is_session_loss() || !self.adapter.is_session_alive().await;
        if !lost {
            return Err(error);
        }

        Err(self.recover(error).await)
    }

    async fn recover(&mut self, cause: ScanError) -> ScanError {
        let cause = cause.to_string();

        if self.scope_recoveries >= self.policy.max_recoveries {
            warn!(
                "Session lost at '{}' with recovery budget exhausted ({} used): {}",
                self.scope, self.scope_recoveries, cause
            );
            self.state = SessionState::Unrecoverable;
            let restored = self.restore().await;
            self.restored = restored.is_ok();
            let attempts = match restored {
                Ok(n) | Err((n, _)) => n,
            };
            self.push_event(cause.clone(), attempts, false);
            return ScanError::SessionUnrecoverable {
                attempts: self.scope_recoveries,
                last_error: cause,
            };
        }

        self.state = SessionState::Recovering;
        warn!("Session lost at '{}': {}; recovering", self.scope, cause);

        match self.restore().await {
            Ok(attempts) => {
                self.scope_recoveries += 1;
                self.state = SessionState::Connected;
                self.restored = true;
                info!(
                    "Session recovered at '{}' after {} attempt(s)",
                    self.scope, attempts
                );
                self.push_event(cause.clone(), attempts, true);
                ScanError::Recovered(cause)
            }
            Err((attempts, last_error)) => {
                self.state = SessionState::Unrecoverable;
                self.restored = false;
                warn!(
                    "Session recovery failed at '{}' after {} attempt(s): {}",
                    self.scope, attempts, last_error
                );
                self.push_event(cause, attempts, false);
                ScanError::SessionUnrecoverable {
                    attempts,
                    last_error,
                }
            }
        }
    }

    /// Reopen and navigate back to the root. Returns the attempt count used.
    async fn restore(&mut self) -> std::result::Result<u32, (u32, String)> {
        let allowed = self.policy.reopen_attempts.max(1);
        let stable = self.policy.stable_timeout;
        let limit = self.policy.recovery_timeout;
        let mut last_error = String::new();

        for attempt in 1..=allowed {
            if attempt > 1 {
                tokio::time::sleep(self.policy.backoff).await;
            }

            let adapter = self.adapter.as_mut();
            let rebuilt = async {
                adapter.reopen().await?;
                adapter.open_root().await?;
                adapter.wait_stable(stable).await
            };

            match tokio::time::timeout(limit, rebuilt).await {
                Ok(Ok(())) => return Ok(attempt),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = ScanError::timeout("session recovery", limit).to_string(),
            }
            debug!("Recovery attempt {}/{} failed: {}", attempt, allowed, last_error);
        }

        Err((allowed, last_error))
    }

    fn push_event(&mut self, cause: String, attempts: u32, recovered: bool) {
        self.events.push(RecoveryEvent {
            scope: self.scope.clone(),
            cause,
            attempts,
            recovered,
            at: Utc::now(),
        });
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.adapter.shutdown().await {
            debug!("Adapter shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{MenuEntry, Operation, ScriptedPortal};
    use crate::tree::CategoryPath;
    use tempfile::TempDir;

    fn portal(dir: &TempDir) -> ScriptedPortal {
        ScriptedPortal::new(
            vec![MenuEntry::branch(
                "M1",
                vec![MenuEntry::branch("S1", vec![MenuEntry::leaf("L1")])],
            )],
            dir.path(),
        )
    }

    fn fast_policy(max_recoveries: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            max_recoveries,
            reopen_attempts: 2,
            recovery_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(1),
            stable_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_loss_is_recovered_and_signalled() {
        let dir = TempDir::new().unwrap();
        let portal = portal(&dir);
        portal.lose_session_on(Operation::Enumerate, 1);
        let mut session = SessionManager::new(Box::new(portal.clone())).with_policy(fast_policy(2));
        session.initialize().await.unwrap();
        session.begin_scope("M1");

        let root = CategoryPath::root();
        let result = session
            .with_session(move |ui| Box::pin(async move { ui.enumerate_children(&root).await }))
            .await;

        assert!(matches!(result, Err(ScanError::Recovered(_))));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.recoveries().len(), 1);
        assert_eq!(session.recoveries()[0].scope, "M1");
        assert_eq!(portal.call_count(Operation::Reopen), 1);
    }

    #[tokio::test]
    async fn test_plain_error_on_live_session_passes_through() {
        let dir = TempDir::new().unwrap();
        let portal = portal(&dir);
        portal.slow_stability(1);
        let mut session = SessionManager::new(Box::new(portal.clone())).with_policy(fast_policy(2));

        let result = session
            .with_session(|ui| Box::pin(async move { ui.wait_stable(Duration::from_millis(5)).await }))
            .await;

        assert!(matches!(result, Err(ScanError::TimeoutExceeded { .. })));
        assert!(session.recoveries().is_empty());
        assert_eq!(portal.call_count(Operation::Reopen), 0);
    }

    #[tokio::test]
    async fn test_budget_is_per_scope() {
        let dir = TempDir::new().unwrap();
        let portal = portal(&dir);
        let mut session = SessionManager::new(Box::new(portal.clone())).with_policy(fast_policy(1));
        session.initialize().await.unwrap();
        session.begin_scope("A");

        portal.kill_session();
        let first = session
            .with_session(|ui| Box::pin(async move { ui.open_root().await }))
            .await;
        assert!(first.unwrap_err().is_recovered());

        portal.kill_session();
        let second = session
            .with_session(|ui| Box::pin(async move { ui.open_root().await }))
            .await;
        assert!(matches!(second, Err(ScanError::SessionUnrecoverable { .. })));
        assert_eq!(session.state(), SessionState::Unrecoverable);

        session.begin_scope("B");
        assert_eq!(session.state(), SessionState::Connected);
        portal.kill_session();
        let third = session
            .with_session(|ui| Box::pin(async move { ui.open_root().await }))
            .await;
        assert!(third.unwrap_err().is_recovered());
    }

    #[tokio::test]
    async fn test_failed_reopen_is_unrecoverable() {
        let dir = TempDir::new().unwrap();
        let portal = portal(&dir);
        let mut session = SessionManager::new(Box::new(portal.clone())).with_policy(fast_policy(3));
        session.initialize().await.unwrap();
        session.begin_scope("A");

        portal.fail_reopens(10);
        portal.kill_session();
        let result = session
            .with_session(|ui| Box::pin(async move { ui.open_root().await }))
            .await;

        match result {
            Err(ScanError::SessionUnrecoverable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected SessionUnrecoverable, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state(), SessionState::Unrecoverable);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_root_unreachable() {
        let dir = TempDir::new().unwrap();
        let portal = portal(&dir);
        portal.fail_open_root();
        let mut session = SessionManager::new(Box::new(portal)).with_policy(fast_policy(1));

        let error = session.initialize().await.unwrap_err();
        assert!(matches!(error, ScanError::RootUnreachable(_)));
        assert!(error.is_fatal());
    }
}
