//! Chromium adapter for the Nexacro-based classification popup.

use crate::adapter::UiAdapter;
use crate::error::{Result, ScanError};
use crate::result::DownloadedFile;
use crate::tree::{CategoryNode, CategoryPath, Level};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const POPUP_URL: &str =
    "https://biz.hira.or.kr/popup.ndo?formname=qya_bizcom%3A%3AInfoBank.xfdl&framename=InfoBank";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSelectors {
    /// Element wrapping the grid's visible rows.
    pub container: String,
    /// Row element id without its numeric suffix.
    pub row_prefix: String,
}

impl GridSelectors {
    fn nexacro(index: u8) -> Self {
        Self {
            container: format!(
                "#InfoBank_RvStdInqIdxPL_form_grdIdxDiv{}_bodyGridBandContainerElement_inner",
                index
            ),
            row_prefix: format!("InfoBank_RvStdInqIdxPL_form_grdIdxDiv{}_body_gridrow_", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub popup_url: String,
    pub classification_button: String,
    pub classification_modal: String,
    pub search_input: String,
    pub search_button: String,
    pub excel_button: String,
    pub close_button_text: String,
    pub no_data_text: String,
    pub major: GridSelectors,
    pub mid: GridSelectors,
    pub minor: GridSelectors,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            popup_url: POPUP_URL.to_string(),
            classification_button: "#InfoBank_form_divMain_divWork1_btnIdxDiv".to_string(),
            classification_modal: "#InfoBank_RvStdInqIdxPL".to_string(),
            search_input: "#InfoBank_form_divMain_divWork1_edtSearchTxt_input".to_string(),
            search_button: "#InfoBank_form_divMain_divWork1_btnS0001".to_string(),
            excel_button: "#InfoBank_form_divMain_divWork1_btnE0001TextBoxElement".to_string(),
            close_button_text: "닫기".to_string(),
            no_data_text: "조회된 데이터가 없습니다".to_string(),
            major: GridSelectors::nexacro(1),
            mid: GridSelectors::nexacro(2),
            minor: GridSelectors::nexacro(3),
        }
    }
}

impl PortalSelectors {
    pub fn grid(&self, level: Level) -> &GridSelectors {
        match level {
            Level::Major => &self.major,
            Level::Mid => &self.mid,
            Level::Minor => &self.minor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NexacroOptions {
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    pub download_dir: PathBuf,
    pub selectors: PortalSelectors,
    pub poll_interval: Duration,
    /// Upper bound for waiting on a single control to appear.
    pub element_timeout: Duration,
}

impl NexacroOptions {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            chrome_executable: None,
            headless: true,
            download_dir: download_dir.into(),
            selectors: PortalSelectors::default(),
            poll_interval: Duration::from_millis(250),
            element_timeout: Duration::from_secs(10),
        }
    }
}

/// Find a Chrome or Chromium binary: `CODETREE_CHROME`, then the usual names on `PATH`.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CODETREE_CHROME") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Read grid rows out of a container's HTML. The ordinal is the row id's numeric suffix.
pub fn parse_grid_rows(html: &str, row_prefix: &str, level: Level) -> Result<Vec<CategoryNode>> {
    let document = Html::parse_fragment(html);
    let selector = Selector::parse(&format!("[id^=\"{}\"]", row_prefix))
        .map_err(|e| ScanError::Other(format!("bad row selector '{}': {:?}", row_prefix, e)))?;

    let mut rows = Vec::new();
    for element in document.select(&selector) {
        let Some(id) = element.value().id() else { continue };
        // nested cells share the prefix but carry a longer suffix
        let Ok(ordinal) = id[row_prefix.len()..].parse::<usize>() else { continue };
        let label = element
            .text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ");
        if label.is_empty() {
            continue;
        }
        rows.push(CategoryNode::new(level, label, ordinal));
    }
    rows.sort_by_key(|n| n.ordinal);
    Ok(rows)
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn browser_error(context: &str, error: impl std::fmt::Display) -> ScanError {
    ScanError::Browser(format!("{}: {}", context, error))
}

/// [`UiAdapter`] driving the real portal through headless Chromium.
pub struct NexacroPortal {
    options: NexacroOptions,
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    files_before_download: HashSet<PathBuf>,
}

impl NexacroPortal {
    pub fn new(options: NexacroOptions) -> Self {
        Self {
            options,
            browser: None,
            handler: None,
            page: None,
            files_before_download: HashSet::new(),
        }
    }

    async fn launch(&mut self) -> Result<()> {
        let chrome = match &self.options.chrome_executable {
            Some(path) => path.clone(),
            None => find_chromium().ok_or_else(|| {
                ScanError::Browser(
                    "Chromium not found; install Chrome or set chrome_executable".to_string(),
                )
            })?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .window_size(1600, 1000);
        builder = if self.options.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        let config = builder
            .build()
            .map_err(|e| browser_error("invalid browser config", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| browser_error("failed to launch Chromium", e))?;

        let task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        tokio::fs::create_dir_all(&self.options.download_dir).await?;
        let download_path = self.options.download_dir.canonicalize()?;
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_path.to_string_lossy().into_owned())
            .build()
            .map_err(|e| browser_error("download behaviour", e))?;
        browser
            .execute(behavior)
            .await
            .map_err(|e| browser_error("failed to set download directory", e))?;

        info!("Chromium launched, downloads go to {}", download_path.display());
        self.browser = Some(browser);
        self.handler = Some(task);
        Ok(())
    }

    fn browser_running(&self) -> bool {
        self.browser.is_some() && self.handler.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| ScanError::SessionLost("no open page".to_string()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| browser_error("script failed", e))?
            .into_value()
            .map_err(|e| browser_error("unexpected script result", e))
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(element) = self.page()?.find_element(selector).await {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(ScanError::timeout(selector, timeout));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn click_selector(&self, selector: &str) -> Result<()> {
        let element = self.wait_for(selector, self.options.element_timeout).await?;
        element
            .click()
            .await
            .map_err(|e| browser_error(&format!("click {}", selector), e))?;
        Ok(())
    }

    async fn page_contains_text(&self, text: &str) -> Result<bool> {
        self.eval(format!(
            "document.body ? document.body.innerText.includes({}) : false",
            js_string(text)
        ))
        .await
    }

    /// Clicks the first element inside `scope` whose trimmed text equals `text`.
    async fn click_text_within(&self, scope: &str, text: &str) -> Result<bool> {
        self.eval(format!(
            r#"(() => {{
                const root = document.querySelector({scope}) || document;
                for (const el of root.querySelectorAll('div, span, button')) {{
                    if (el.textContent.trim() === {text} && el.offsetParent !== null) {{
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            scope = js_string(scope),
            text = js_string(text),
        ))
        .await
    }

    async fn grid_fingerprint(&self) -> Result<String> {
        let selectors = &self.options.selectors;
        let containers = [
            &selectors.major.container,
            &selectors.mid.container,
            &selectors.minor.container,
        ]
        .iter()
        .map(|s| js_string(s))
        .collect::<Vec<_>>()
        .join(",");
        self.eval(format!(
            r#"document.readyState + '|' + [{containers}]
                .map(s => {{ const el = document.querySelector(s); return el ? el.innerHTML.length : -1; }})
                .join(',')"#
        ))
        .await
    }

    async fn completed_downloads(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.options.download_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let partial = path
                .extension()
                .is_some_and(|e| e == "crdownload" || e == "tmp");
            if entry.file_type().await?.is_file() && !partial {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl UiAdapter for NexacroPortal {
    async fn open_root(&mut self) -> Result<()> {
        if self.page.is_none() {
            self.reopen().await?;
        }
        let selectors = self.options.selectors.clone();
        debug!("Opening {}", selectors.popup_url);

        let page = self.page()?;
        page.goto(selectors.popup_url.as_str())
            .await
            .map_err(|e| ScanError::SessionLost(format!("navigation failed: {}", e)))?;
        let _ = page.wait_for_navigation().await;

        self.wait_for(&selectors.search_input, self.options.element_timeout * 3)
            .await?;
        self.click_selector(&selectors.classification_button).await?;
        self.wait_for(&selectors.classification_modal, self.options.element_timeout)
            .await
            .map_err(|_| ScanError::ElementNotFound("classification modal did not open".to_string()))?;
        self.wait_for(&selectors.major.container, self.options.element_timeout)
            .await?;
        Ok(())
    }

    async fn enumerate_children(&mut self, parent: &CategoryPath) -> Result<Vec<CategoryNode>> {
        let Some(level) = parent.child_level() else {
            return Ok(Vec::new());
        };
        let grid = self.options.selectors.grid(level).clone();
        let html: String = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.outerHTML : ''; }})()",
                js_string(&grid.container)
            ))
            .await?;

        let rows = parse_grid_rows(&html, &grid.row_prefix, level)?;
        debug!("{} {} rows under '{}'", rows.len(), level, parent);
        Ok(rows)
    }

    async fn click(&mut self, node: &CategoryNode) -> Result<()> {
        let grid = self.options.selectors.grid(node.level);
        let selector = format!("#{}{}", grid.row_prefix, node.ordinal);
        let element = self
            .page()?
            .find_element(selector.as_str())
            .await
            .map_err(|_| ScanError::ElementNotFound(format!("row {} '{}'", node.ordinal, node.label)))?;

        let shown = element
            .inner_text()
            .await
            .map_err(|e| browser_error("read row text", e))?
            .unwrap_or_default();
        let shown = shown.split_whitespace().collect::<Vec<_>>().join(" ");
        if shown != node.label {
            return Err(ScanError::ElementNotFound(format!(
                "row {} shows '{}' instead of '{}'",
                node.ordinal, shown, node.label
            )));
        }

        element
            .click()
            .await
            .map_err(|e| browser_error(&format!("click row '{}'", node.label), e))?;
        Ok(())
    }

    async fn wait_stable(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<String> = None;
        loop {
            let current = self.grid_fingerprint().await?;
            if current.starts_with("complete|") && previous.as_deref() == Some(current.as_str()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScanError::timeout("page to settle", timeout));
            }
            previous = Some(current);
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn is_session_alive(&mut self) -> bool {
        let Ok(page) = self.page() else { return false };
        matches!(
            tokio::time::timeout(Duration::from_secs(5), page.evaluate("1 + 1")).await,
            Ok(Ok(_))
        )
    }

    async fn reopen(&mut self) -> Result<()> {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            debug!("Ignoring error closing dead page: {}", e);
        }

        if !self.browser_running() {
            if let Some(task) = self.handler.take() {
                task.abort();
            }
            self.browser = None;
            self.launch().await?;
        }

        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| ScanError::Browser("browser not running".to_string()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| browser_error("failed to open a new page", e))?;
        self.page = Some(page);
        Ok(())
    }

    async fn trigger_download(&mut self, leaf: &CategoryPath) -> Result<()> {
        let selectors = self.options.selectors.clone();

        if !self
            .click_text_within(&selectors.classification_modal, &selectors.close_button_text)
            .await?
        {
            debug!("No close button found, assuming the modal already closed");
        }

        let value: String = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.value : ''; }})()",
                js_string(&selectors.search_input)
            ))
            .await?;
        if value.trim().is_empty() {
            return Err(ScanError::ElementNotFound("search input empty".to_string()));
        }
        debug!("Searching '{}' for '{}'", value.trim(), leaf);

        self.files_before_download = self.completed_downloads().await?.into_iter().collect();
        self.click_selector(&selectors.search_button).await?;
        self.wait_stable(self.options.element_timeout).await?;

        if self.page_contains_text(&selectors.no_data_text).await? {
            return Err(ScanError::DownloadFailed(format!("no results for '{}'", leaf)));
        }
        self.click_selector(&selectors.excel_button).await
    }

    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile> {
        let deadline = Instant::now() + timeout;
        loop {
            let fresh: Vec<PathBuf> = self
                .completed_downloads()
                .await?
                .into_iter()
                .filter(|p| !self.files_before_download.contains(p))
                .collect();
            if let Some(path) = fresh.into_iter().next() {
                let suggested_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                self.files_before_download.insert(path.clone());
                return Ok(DownloadedFile {
                    path,
                    suggested_name,
                });
            }
            if Instant::now() >= deadline {
                return Err(ScanError::timeout("download", timeout));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    fn download_leaves_tree(&self) -> bool {
        true
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if let Some(mut browser) = self.browser.take() {
            let _ = browser.close().await;
        }
        if let Some(task) = self.handler.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for NexacroPortal {
    fn drop(&mut self) {
        if let Some(task) = self.handler.take() {
            task.abort();
        }
    }
}

/// Directory Chromium writes into for this run.
pub fn run_download_dir(base: &Path, run_id: &str) -> PathBuf {
    base.join(".downloads").join(run_id)
}
