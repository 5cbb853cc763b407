//! In-memory portal used for rehearsal runs and tests.
//!
//! Models the portal's three linked grids: selecting a row at one level
//! replaces the grid below it. Faults can be scheduled per operation to
//! exercise session recovery without a browser.

use crate::adapter::UiAdapter;
use crate::error::{Result, ScanError};
use crate::result::DownloadedFile;
use crate::tree::{CategoryNode, CategoryPath, Level};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub label: String,
    #[serde(default)]
    pub children: Vec<MenuEntry>,
}

impl MenuEntry {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    pub fn branch(label: impl Into<String>, children: Vec<MenuEntry>) -> Self {
        Self {
            label: label.into(),
            children,
        }
    }
}

/// Load a menu tree from a JSON array of `{ "label": .., "children": [..] }` entries.
pub fn load_menu(path: &Path) -> Result<Vec<MenuEntry>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| ScanError::Other(format!("invalid menu file {}: {}", path.display(), e)))
}

/// Leaf paths of a menu in pre-order, as `" > "` keys.
pub fn leaf_keys(menu: &[MenuEntry]) -> Vec<String> {
    fn walk(entries: &[MenuEntry], level: Level, prefix: &CategoryPath, out: &mut Vec<String>) {
        let nodes = crate::tree::order_siblings(
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| CategoryNode::new(level, e.label.clone(), i))
                .collect(),
        );
        for (entry, node) in entries.iter().zip(nodes) {
            let Ok(path) = prefix.child(node) else { continue };
            match level.child() {
                None => out.push(path.key()),
                Some(next) => walk(&entry.children, next, &path, out),
            }
        }
    }

    let mut out = Vec::new();
    walk(menu, Level::Major, &CategoryPath::root(), &mut out);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpenRoot,
    Enumerate,
    Click,
    WaitStable,
    TriggerDownload,
    AwaitDownload,
    Reopen,
}

#[derive(Debug, Default)]
struct Faults {
    lose_on: HashMap<Operation, Vec<u32>>,
    kill_after: HashMap<Operation, Vec<u32>>,
    failing_reopens: u32,
    open_root_broken: bool,
    slow_stable: u32,
    missing_elements: HashMap<String, u32>,
    lose_on_download: HashMap<String, u32>,
    failing_downloads: Vec<String>,
    menu_after_reopen: Option<Vec<MenuEntry>>,
}

#[derive(Debug)]
struct State {
    menu: Vec<MenuEntry>,
    download_dir: PathBuf,
    alive: bool,
    at_root: bool,
    selection: Vec<usize>,
    pending_download: Option<String>,
    leaves_tree: bool,
    calls: HashMap<Operation, u32>,
    downloads: Vec<String>,
    download_attempts: HashMap<String, u32>,
    faults: Faults,
}

/// Scripted [`UiAdapter`]. Clones share state, so a test can keep a handle
/// for inspection after boxing one into the walker.
#[derive(Clone)]
pub struct ScriptedPortal {
    state: Arc<Mutex<State>>,
}

impl ScriptedPortal {
    pub fn new(menu: Vec<MenuEntry>, download_dir: impl AsRef<Path>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                menu,
                download_dir: download_dir.as_ref().to_path_buf(),
                alive: true,
                at_root: false,
                selection: Vec::new(),
                pending_download: None,
                leaves_tree: false,
                calls: HashMap::new(),
                downloads: Vec::new(),
                download_attempts: HashMap::new(),
                faults: Faults::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The session dies when `op` is called for the `nth` time (1-based).
    pub fn lose_session_on(&self, op: Operation, nth: u32) {
        self.lock().faults.lose_on.entry(op).or_default().push(nth);
    }

    /// The `nth` call of `op` succeeds, then the session dies.
    pub fn kill_after(&self, op: Operation, nth: u32) {
        self.lock().faults.kill_after.entry(op).or_default().push(nth);
    }

    pub fn kill_session(&self) {
        self.lock().alive = false;
    }

    pub fn fail_reopens(&self, count: u32) {
        self.lock().faults.failing_reopens = count;
    }

    pub fn fail_open_root(&self) {
        self.lock().faults.open_root_broken = true;
    }

    /// The next `count` stability waits time out on a live page.
    pub fn slow_stability(&self, count: u32) {
        self.lock().faults.slow_stable = count;
    }

    /// Clicking a row with this label reports it missing `count` times.
    pub fn hide_element(&self, label: &str, count: u32) {
        self.lock()
            .faults
            .missing_elements
            .insert(label.to_string(), count);
    }

    /// Triggering the download for `key` kills the session `count` times.
    pub fn lose_session_on_download(&self, key: &str, count: u32) {
        self.lock()
            .faults
            .lose_on_download
            .insert(key.to_string(), count);
    }

    pub fn fail_download(&self, key: &str) {
        self.lock().faults.failing_downloads.push(key.to_string());
    }

    /// Swap in a different menu at the next successful reopen.
    pub fn replace_menu_on_reopen(&self, menu: Vec<MenuEntry>) {
        self.lock().faults.menu_after_reopen = Some(menu);
    }

    pub fn set_download_leaves_tree(&self, leaves_tree: bool) {
        self.lock().leaves_tree = leaves_tree;
    }

    pub fn call_count(&self, op: Operation) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Leaf keys whose download completed, in order.
    pub fn downloads(&self) -> Vec<String> {
        self.lock().downloads.clone()
    }

    /// `await_download` calls made while `key` was the pending download.
    pub fn download_attempts(&self, key: &str) -> u32 {
        self.lock().download_attempts.get(key).copied().unwrap_or(0)
    }
}

impl State {
    /// Count the call and apply scheduled session loss. Returns the call number.
    fn enter(&mut self, op: Operation) -> Result<u32> {
        let count = self.calls.entry(op).or_insert(0);
        *count += 1;
        let n = *count;

        if op == Operation::Reopen {
            return Ok(n);
        }
        if self
            .faults
            .lose_on
            .get(&op)
            .is_some_and(|calls| calls.contains(&n))
        {
            debug!("scripted: session lost on {:?} #{}", op, n);
            self.alive = false;
        }
        if !self.alive {
            return Err(ScanError::SessionLost(format!("page closed during {:?}", op)));
        }
        Ok(n)
    }

    fn leave(&mut self, op: Operation, n: u32) {
        if self
            .faults
            .kill_after
            .get(&op)
            .is_some_and(|calls| calls.contains(&n))
        {
            debug!("scripted: session killed after {:?} #{}", op, n);
            self.alive = false;
        }
    }

    fn require_root(&self) -> Result<()> {
        if self.at_root {
            Ok(())
        } else {
            Err(ScanError::ElementNotFound(
                "classification view is not open".to_string(),
            ))
        }
    }

    fn entries_under(&self, depth: usize) -> &[MenuEntry] {
        let mut entries = self.menu.as_slice();
        for &index in self.selection.iter().take(depth) {
            match entries.get(index) {
                Some(entry) => entries = entry.children.as_slice(),
                None => return &[],
            }
        }
        entries
    }

    fn selected_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        let mut entries = self.menu.as_slice();
        for &index in &self.selection {
            let Some(entry) = entries.get(index) else { break };
            labels.push(entry.label.clone());
            entries = entry.children.as_slice();
        }
        labels
    }
}

#[async_trait]
impl UiAdapter for ScriptedPortal {
    async fn open_root(&mut self) -> Result<()> {
        let mut state = self.lock();
        let n = state.enter(Operation::OpenRoot)?;
        if state.faults.open_root_broken {
            return Err(ScanError::ElementNotFound(
                "classification button".to_string(),
            ));
        }
        state.at_root = true;
        state.selection.clear();
        state.pending_download = None;
        state.leave(Operation::OpenRoot, n);
        Ok(())
    }

    async fn enumerate_children(&mut self, parent: &CategoryPath) -> Result<Vec<CategoryNode>> {
        let mut state = self.lock();
        let n = state.enter(Operation::Enumerate)?;
        state.require_root()?;

        let Some(level) = parent.child_level() else {
            return Ok(Vec::new());
        };
        let depth = parent.depth();
        let selected = state.selected_labels();
        let wanted: Vec<String> = parent.labels().iter().map(|l| l.to_string()).collect();
        if selected.len() < depth || selected[..depth] != wanted[..] {
            return Err(ScanError::ElementNotFound(format!(
                "grid for '{}' is not displayed",
                parent
            )));
        }

        let nodes = state
            .entries_under(depth)
            .iter()
            .enumerate()
            .map(|(ordinal, entry)| CategoryNode::new(level, entry.label.clone(), ordinal))
            .collect();
        state.leave(Operation::Enumerate, n);
        Ok(nodes)
    }

    async fn click(&mut self, node: &CategoryNode) -> Result<()> {
        let mut state = self.lock();
        let n = state.enter(Operation::Click)?;
        state.require_root()?;

        if let Some(remaining) = state.faults.missing_elements.get_mut(&node.label)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ScanError::ElementNotFound(format!("row '{}'", node.label)));
        }

        let depth = node.level.depth();
        if state.selection.len() < depth {
            return Err(ScanError::ElementNotFound(format!(
                "grid for {} rows is not displayed",
                node.level
            )));
        }
        let visible = state
            .entries_under(depth)
            .get(node.ordinal)
            .is_some_and(|entry| entry.label == node.label);
        if !visible {
            return Err(ScanError::ElementNotFound(format!(
                "row {} '{}'",
                node.ordinal, node.label
            )));
        }

        state.selection.truncate(depth);
        state.selection.push(node.ordinal);
        state.leave(Operation::Click, n);
        Ok(())
    }

    async fn wait_stable(&mut self, timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        let n = state.enter(Operation::WaitStable)?;
        if state.faults.slow_stable > 0 {
            state.faults.slow_stable -= 1;
            return Err(ScanError::timeout("grid to settle", timeout));
        }
        state.leave(Operation::WaitStable, n);
        Ok(())
    }

    async fn is_session_alive(&mut self) -> bool {
        self.lock().alive
    }

    async fn reopen(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.enter(Operation::Reopen)?;
        if state.faults.failing_reopens > 0 {
            state.faults.failing_reopens -= 1;
            return Err(ScanError::Browser("could not open a new page".to_string()));
        }
        state.alive = true;
        state.at_root = false;
        state.selection.clear();
        state.pending_download = None;
        if let Some(menu) = state.faults.menu_after_reopen.take() {
            debug!("scripted: menu replaced on reopen");
            state.menu = menu;
        }
        Ok(())
    }

    async fn trigger_download(&mut self, leaf: &CategoryPath) -> Result<()> {
        let mut state = self.lock();
        let n = state.enter(Operation::TriggerDownload)?;
        state.require_root()?;

        let key = leaf.key();
        if let Some(remaining) = state.faults.lose_on_download.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            state.alive = false;
            return Err(ScanError::SessionLost(format!(
                "page crashed while exporting '{}'",
                key
            )));
        }

        let wanted: Vec<String> = leaf.labels().iter().map(|l| l.to_string()).collect();
        if !leaf.is_leaf() || state.selected_labels() != wanted {
            return Err(ScanError::ElementNotFound(format!(
                "leaf '{}' is not selected",
                key
            )));
        }

        state.pending_download = Some(key);
        if state.leaves_tree {
            state.at_root = false;
            state.selection.clear();
        }
        state.leave(Operation::TriggerDownload, n);
        Ok(())
    }

    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile> {
        let (path, key, n) = {
            let mut state = self.lock();
            let n = state.enter(Operation::AwaitDownload)?;
            let Some(key) = state.pending_download.take() else {
                return Err(ScanError::timeout("download", timeout));
            };
            *state.download_attempts.entry(key.clone()).or_insert(0) += 1;
            if state.faults.failing_downloads.contains(&key) {
                return Err(ScanError::DownloadFailed(format!(
                    "server returned no file for '{}'",
                    key
                )));
            }
            let path = state
                .download_dir
                .join(format!("export_{}.xlsx", state.downloads.len() + 1));
            (path, key, n)
        };

        tokio::fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).await?;
        tokio::fs::write(&path, key.as_bytes()).await?;

        let mut state = self.lock();
        state.downloads.push(key);
        state.leave(Operation::AwaitDownload, n);
        Ok(DownloadedFile {
            path,
            suggested_name: Some("export.xlsx".to_string()),
        })
    }

    fn download_leaves_tree(&self) -> bool {
        self.lock().leaves_tree
    }
}
