use crate::error::Result;
use crate::result::DownloadedFile;
use crate::tree::{CategoryNode, CategoryPath};
use async_trait::async_trait;
use std::time::Duration;

/// Capabilities the walker needs from whatever drives the portal UI.
///
/// Implementations hold the single live session. They never retry or recover
/// on their own; that is the job of [`crate::session::SessionManager`].
#[async_trait]
pub trait UiAdapter: Send {
    /// Navigate to the classification root (all majors visible).
    async fn open_root(&mut self) -> Result<()>;

    /// Children of the node last reached along `parent`, as shown on screen.
    async fn enumerate_children(&mut self, parent: &CategoryPath) -> Result<Vec<CategoryNode>>;

    async fn click(&mut self, node: &CategoryNode) -> Result<()>;

    async fn wait_stable(&mut self, timeout: Duration) -> Result<()>;

    async fn is_session_alive(&mut self) -> bool;

    /// Discard the current page and open a fresh one. Does not navigate.
    async fn reopen(&mut self) -> Result<()>;

    /// Start the download for the currently selected leaf.
    async fn trigger_download(&mut self, leaf: &CategoryPath) -> Result<()>;

    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile>;

    /// True when starting a download closes the classification view, so the
    /// walker has to navigate back down before the next sibling.
    fn download_leaves_tree(&self) -> bool {
        false
    }

    /// Release browser resources. Called once when the walk ends.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
