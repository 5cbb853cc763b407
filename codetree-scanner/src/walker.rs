//! Depth-first walk of the classification tree.
//!
//! The walk keeps an explicit stack of frames instead of recursing through the
//! UI. `frames[0]` is the root (listing majors), so the stack never grows past
//! three; leaves are visited from their mid frame and never pushed. A child's
//! index only advances once that child is finished, which is what lets the
//! walker rebuild its position after the session is replaced.

use crate::artifact::ArtifactStore;
use crate::error::{Result, ScanError};
use crate::result::{ArtifactRef, VisitRecord};
use crate::session::{RecoveryEvent, SessionManager, SessionState};
use crate::tree::{locate, order_siblings, CategoryNode, CategoryPath};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Called with the number of distinct leaves reached so far and the leaf about to be handled.
pub type ProgressCallback = Arc<dyn Fn(usize, &CategoryPath) + Send + Sync>;
/// Returns true when a prior run already downloaded this leaf.
pub type CompletedCheck = Arc<dyn Fn(&CategoryPath) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WalkerSettings {
    pub stable_timeout: Duration,
    pub download_timeout: Duration,
    /// Re-enumerate-and-retry rounds for a row that cannot be clicked.
    pub element_retries: u32,
    /// Multiplier applied to `stable_timeout` for the single slow-page retry.
    pub extended_wait_factor: f64,
}

impl Default for WalkerSettings {
    fn default() -> Self {
        Self {
            stable_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            element_retries: 2,
            extended_wait_factor: 3.0,
        }
    }
}

struct Frame {
    path: CategoryPath,
    children: Vec<CategoryNode>,
    next: usize,
    /// Length of the most recent on-screen enumeration.
    shown_len: usize,
}

impl Frame {
    fn new(path: CategoryPath, children: Vec<CategoryNode>) -> Self {
        Self {
            path,
            shown_len: children.len(),
            children,
            next: 0,
        }
    }

    fn current(&self) -> Option<&CategoryNode> {
        self.children.get(self.next)
    }

    /// Merge a fresh enumeration into the frame. Finished siblings are kept as
    /// history, the current child becomes `found` (or stays as-is when it has
    /// vanished), and anything not seen before is queued as new work.
    fn reconcile(&mut self, fresh: Vec<CategoryNode>, found: Option<&CategoryNode>) {
        let done = self.next.min(self.children.len());
        let finished: HashSet<String> = self.children[..done]
            .iter()
            .map(CategoryNode::key_segment)
            .collect();

        self.shown_len = fresh.len();
        let mut children = self.children[..done].to_vec();
        match (found, self.children.get(done)) {
            (Some(found), _) => children.push(found.clone()),
            (None, Some(stale)) => children.push(stale.clone()),
            (None, None) => {}
        }
        children.extend(
            fresh
                .into_iter()
                .filter(|n| Some(n) != found && !finished.contains(&n.key_segment())),
        );
        self.children = children;
    }
}

pub struct TreeWalker {
    session: SessionManager,
    settings: WalkerSettings,
    artifacts: ArtifactStore,
    completed: Option<CompletedCheck>,
    progress_callback: Option<ProgressCallback>,
    cancel: Arc<AtomicBool>,
    frames: Vec<Frame>,
    /// Depth of the start path; frames above it are never advanced.
    scope_depth: usize,
    needs_redescend: bool,
    started: bool,
    finished: bool,
    cancelled: bool,
    pending: VecDeque<VisitRecord>,
    discovered: Vec<CategoryPath>,
    discovered_keys: HashSet<String>,
}

impl TreeWalker {
    pub fn new(session: SessionManager, artifacts: ArtifactStore) -> Self {
        Self {
            session,
            settings: WalkerSettings::default(),
            artifacts,
            completed: None,
            progress_callback: None,
            cancel: Arc::new(AtomicBool::new(false)),
            frames: Vec::new(),
            scope_depth: 0,
            needs_redescend: false,
            started: false,
            finished: false,
            cancelled: false,
            pending: VecDeque::new(),
            discovered: Vec::new(),
            discovered_keys: HashSet::new(),
        }
    }

    pub fn with_settings(mut self, settings: WalkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_completed_check(mut self, check: CompletedCheck) -> Self {
        self.completed = Some(check);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Distinct leaf paths reached so far, in discovery order.
    pub fn discovered_paths(&self) -> &[CategoryPath] {
        &self.discovered
    }

    pub fn recoveries(&self) -> &[RecoveryEvent] {
        self.session.recoveries()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Open the root and, when given, descend to `start` and confine the walk
    /// to its subtree. Errors here are fatal for the run.
    pub async fn start(&mut self, start: Option<&CategoryPath>) -> Result<()> {
        if self.started {
            return Err(ScanError::Other("walk already started".to_string()));
        }
        self.started = true;

        self.session.initialize().await?;
        let root = CategoryPath::root();
        let majors = self
            .enumerate(&root)
            .await
            .map_err(|e| ScanError::RootUnreachable(e.to_string()))?;
        info!("Classification root lists {} major categories", majors.len());
        self.frames.push(Frame::new(root, majors));

        if let Some(target) = start.filter(|p| !p.is_root()) {
            self.descend_start(target).await?;
        }
        Ok(())
    }

    async fn descend_start(&mut self, target: &CategoryPath) -> Result<()> {
        let not_found = || ScanError::PathNotFound(target.key());

        for wanted in target.nodes() {
            let top = self.frames.len() - 1;
            let frame = &mut self.frames[top];
            let found = locate(&frame.children, wanted, None)
                .cloned()
                .ok_or_else(not_found)?;
            frame.next = frame
                .children
                .iter()
                .position(|n| *n == found)
                .ok_or_else(not_found)?;

            if found.is_leaf() {
                break;
            }

            self.session.begin_scope(&frame.path.child(found)?.key());
            let (path, children) = self
                .open_branch(top)
                .await
                .map_err(|e| ScanError::PathNotFound(format!("{}: {}", target.key(), e)))?;
            self.frames.push(Frame::new(path, children));
        }

        self.scope_depth = target.depth();
        info!("Walk confined to '{}'", target);
        Ok(())
    }

    /// Lazy stream of visit records. Ends at natural termination or cancellation.
    pub async fn traverse(
        &mut self,
        start: Option<&CategoryPath>,
    ) -> Result<impl Stream<Item = VisitRecord> + '_> {
        self.start(start).await?;
        Ok(stream::unfold(self, |walker| async move {
            let record = walker.next_visit().await?;
            Some((record, walker))
        }))
    }

    /// Pull the next record, doing as much UI work as needed to produce it.
    pub async fn next_visit(&mut self) -> Option<VisitRecord> {
        if !self.started {
            warn!("next_visit called before start");
            return None;
        }

        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            if self.finished {
                return None;
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!("Walk cancelled");
                self.cancelled = true;
                self.finished = true;
                return None;
            }
            self.step().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.session.shutdown().await;
    }

    async fn step(&mut self) {
        if self.needs_redescend {
            self.redescend().await;
            return;
        }

        let (parent, child) = match self.frames.last() {
            Some(frame) => (frame.path.clone(), frame.current().cloned()),
            None => {
                self.finished = true;
                return;
            }
        };
        let Some(child) = child else {
            self.pop_frame();
            return;
        };

        let path = match parent.child(child) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping malformed child of '{}': {}", parent, e);
                self.pending.push_back(VisitRecord::failed(parent, &e));
                self.advance();
                return;
            }
        };

        self.session.begin_scope(&path.key());
        if path.is_leaf() {
            self.visit_leaf(path).await;
        } else {
            self.enter_branch(path).await;
        }
    }

    async fn visit_leaf(&mut self, path: CategoryPath) {
        if self.discovered_keys.insert(path.key()) {
            self.discovered.push(path.clone());
            if let Some(callback) = &self.progress_callback {
                callback(self.discovered.len(), &path);
            }
        }

        if self.completed.as_ref().is_some_and(|check| check(&path)) {
            debug!("Skipping '{}', already downloaded", path);
            self.pending.push_back(VisitRecord::skipped(path));
            self.advance();
            return;
        }

        let top = self.frames.len() - 1;
        let outcome = self.download_leaf(top).await;
        let lost = match outcome {
            Ok((artifact, stored_at)) => {
                info!("Downloaded '{}' -> {}", path, artifact.path.display());
                self.pending
                    .push_back(VisitRecord::success(path, artifact).at(stored_at));
                false
            }
            Err(e) if e.is_recovered() => {
                debug!("Retrying '{}' after session recovery", path);
                self.needs_redescend = true;
                return;
            }
            Err(e) => {
                warn!("Leaf '{}' failed: {}", path, e);
                let lost = matches!(e, ScanError::SessionUnrecoverable { .. });
                self.pending.push_back(VisitRecord::failed(path, &e));
                lost
            }
        };

        self.advance();
        if lost || self.session.download_leaves_tree() {
            self.needs_redescend = true;
        }
    }

    /// Click, export and store one leaf. The returned instant names the
    /// artifact and stamps its record.
    async fn download_leaf(&mut self, index: usize) -> Result<(ArtifactRef, DateTime<Utc>)> {
        let path = self.click_child(index).await?;
        self.settle().await?;

        let leaf = path.clone();
        self.session
            .with_session(move |ui| Box::pin(async move { ui.trigger_download(&leaf).await }))
            .await?;

        let timeout = self.settings.download_timeout;
        let file = self
            .session
            .with_session(move |ui| Box::pin(async move { ui.await_download(timeout).await }))
            .await?;

        let stored_at = Utc::now();
        let artifact = self.artifacts.store(&path, file, stored_at).await?;
        Ok((artifact, stored_at))
    }

    async fn enter_branch(&mut self, path: CategoryPath) {
        let top = self.frames.len() - 1;
        match self.open_branch(top).await {
            Ok((path, children)) if children.is_empty() => {
                debug!("'{}' has no children", path);
                self.advance();
            }
            Ok((path, children)) => {
                debug!("Entering '{}' ({} children)", path, children.len());
                self.frames.push(Frame::new(path, children));
            }
            Err(e) if e.is_recovered() => {
                debug!("Re-entering '{}' after session recovery", path);
                self.needs_redescend = true;
            }
            Err(e) => {
                warn!("Branch '{}' failed: {}", path, e);
                let lost = matches!(e, ScanError::SessionUnrecoverable { .. });
                self.pending.push_back(VisitRecord::failed(path, &e));
                self.advance();
                if lost {
                    self.needs_redescend = true;
                }
            }
        }
    }

    /// Click the current child of `frames[index]` and list its children.
    async fn open_branch(&mut self, index: usize) -> Result<(CategoryPath, Vec<CategoryNode>)> {
        let path = self.click_child(index).await?;
        self.settle().await?;
        let children = self.enumerate(&path).await?;
        Ok((path, children))
    }

    /// Click the current child of `frames[index]`, relocating it after
    /// re-enumeration when the row cannot be found.
    async fn click_child(&mut self, index: usize) -> Result<CategoryPath> {
        let mut attempts = 0;
        loop {
            let frame = &self.frames[index];
            let parent = frame.path.clone();
            let node = frame
                .current()
                .cloned()
                .ok_or_else(|| ScanError::Other(format!("no pending child under '{}'", parent)))?;

            let target = node.clone();
            let clicked = self
                .session
                .with_session(move |ui| Box::pin(async move { ui.click(&target).await }))
                .await;

            match clicked {
                Ok(()) => return parent.child(node),
                Err(ScanError::ElementNotFound(detail)) if attempts < self.settings.element_retries => {
                    attempts += 1;
                    debug!(
                        "Row '{}' not clickable ({}), re-reading '{}' ({}/{})",
                        node.label, detail, parent, attempts, self.settings.element_retries
                    );
                    let fresh = self.enumerate(&parent).await?;
                    let shown_len = self.frames[index].shown_len;
                    let Some(found) = locate(&fresh, &node, Some(shown_len)).cloned() else {
                        return Err(ScanError::ElementNotFound(detail));
                    };
                    self.frames[index].reconcile(fresh, Some(&found));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the page to settle, allowing one longer wait for slow loads.
    async fn settle(&mut self) -> Result<()> {
        let base = self.settings.stable_timeout;
        let first = self
            .session
            .with_session(move |ui| Box::pin(async move { ui.wait_stable(base).await }))
            .await;

        match first {
            Err(ScanError::TimeoutExceeded { .. }) => {
                let extended = base.mul_f64(self.settings.extended_wait_factor.max(1.0));
                debug!("Page still settling, waiting up to {:?}", extended);
                self.session
                    .with_session(move |ui| Box::pin(async move { ui.wait_stable(extended).await }))
                    .await
            }
            other => other,
        }
    }

    async fn enumerate(&mut self, path: &CategoryPath) -> Result<Vec<CategoryNode>> {
        let Some(level) = path.child_level() else {
            return Ok(Vec::new());
        };
        let parent = path.clone();
        let nodes = self
            .session
            .with_session(move |ui| Box::pin(async move { ui.enumerate_children(&parent).await }))
            .await?;

        Ok(order_siblings(
            nodes
                .into_iter()
                .map(|mut n| {
                    n.level = level;
                    n
                })
                .collect(),
        ))
    }

    /// Navigate from the root back down to the frame on top of the stack.
    ///
    /// Each held node is matched by label first and by position only when its
    /// sibling list kept its length. A node that is gone fails with
    /// `PathNotFoundAfterRecovery` and the walk backs up one level.
    ///
    /// The way back runs under the scope of the unit waiting on the top frame,
    /// so any other failure on the way is charged to that unit alone.
    async fn redescend(&mut self) {
        let Some(unit) = self.pending_unit() else {
            // nothing left on this level; back up before navigating
            self.pop_frame();
            return;
        };
        self.session.begin_scope(&unit.key());
        debug!("Re-establishing position for '{}'", unit);

        let reopened = self
            .session
            .with_session(|ui| Box::pin(async move { ui.open_root().await }))
            .await;
        if let Err(e) = reopened {
            self.redescend_failed(unit, e);
            return;
        }
        if let Err(e) = self.settle().await {
            self.redescend_failed(unit, e);
            return;
        }

        let mut k = 0;
        while k < self.frames.len() {
            let path = self.frames[k].path.clone();
            let fresh = match self.enumerate(&path).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    self.redescend_failed(unit, e);
                    return;
                }
            };

            let frame = &mut self.frames[k];
            if let Some(target) = frame.current().cloned() {
                match locate(&fresh, &target, Some(frame.shown_len)).cloned() {
                    Some(found) => {
                        if found.label != target.label {
                            info!(
                                "'{}' under '{}' now appears as '{}'",
                                target.label, path, found.label
                            );
                        }
                        frame.reconcile(fresh, Some(&found));
                    }
                    None => {
                        frame.reconcile(fresh, None);
                        let missing = path.child(target).unwrap_or_else(|_| path.clone());
                        let error = ScanError::PathNotFoundAfterRecovery(missing.key());
                        warn!("{}", error);
                        self.pending.push_back(VisitRecord::failed(missing, &error));
                        self.frames.truncate(k + 1);
                        self.advance();
                        self.needs_redescend = false;
                        return;
                    }
                }
            } else {
                frame.reconcile(fresh, None);
            }

            if k + 1 < self.frames.len() {
                let opened = match self.click_child(k).await {
                    Ok(path) => self.settle().await.map(|_| path),
                    Err(e) => Err(e),
                };
                match opened {
                    Ok(path) => self.frames[k + 1].path = path,
                    Err(e) => {
                        self.redescend_failed(unit, e);
                        return;
                    }
                }
            }
            k += 1;
        }

        self.needs_redescend = false;
    }

    /// Path of the child the top frame is waiting to handle.
    fn pending_unit(&self) -> Option<CategoryPath> {
        let frame = self.frames.last()?;
        let node = frame.current()?.clone();
        Some(frame.path.child(node).unwrap_or_else(|_| frame.path.clone()))
    }

    /// The way back to `unit` failed: record it and move on to its next
    /// sibling, which gets its own attempt at navigating back.
    fn redescend_failed(&mut self, unit: CategoryPath, error: ScanError) {
        if error.is_recovered() {
            // the session was rebuilt again; start over from the root
            return;
        }

        warn!("Could not return to '{}': {}", unit, error);
        self.pending.push_back(VisitRecord::failed(unit, &error));
        self.advance();
        self.needs_redescend = true;
    }

    /// Mark the current child of the top frame as finished.
    fn advance(&mut self) {
        let Some(top) = self.frames.len().checked_sub(1) else {
            self.finished = true;
            return;
        };
        if top < self.scope_depth {
            // the start path itself is done
            self.finished = true;
            return;
        }
        self.frames[top].next += 1;
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
        if self.frames.is_empty() {
            self.finished = true;
        } else {
            self.advance();
        }
    }
}
