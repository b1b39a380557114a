// src/quartr/session.rs
//
// Headless Chrome session against the earnings portal. Every browser call is
// blocking, so each step runs on tokio's blocking pool with a cloned tab handle.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Browser::{SetDownloadBehavior, SetDownloadBehaviorBehaviorOption};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use reqwest::header;
use tokio::sync::Mutex;

use crate::quartr::locators::{self, Locator};
use crate::quartr::models::{DocumentKind, DownloadedDocument, Period};
use crate::quartr::{DocumentPortal, PortalLauncher};
use crate::utils::config::{Credentials, Settings};
use crate::utils::error::{AppError, PortalError};
use crate::utils::html_debug;

const SEARCH_SETTLE_MS: u64 = 1200;
const QUARTER_SETTLE_MS: u64 = 600;
const CLICK_SETTLE_MS: u64 = 1500;
const POLL_INTERVAL_MS: u64 = 250;
// How long a quarter tile or document tile gets to show up before we call it absent.
const OPTIONAL_ELEMENT_TIMEOUT: Duration = Duration::from_secs(4);
// A click that starts no download within this window is treated as a no-op.
const DOWNLOAD_START_GRACE: Duration = Duration::from_secs(2);
const PARTIAL_DOWNLOAD_EXT: &str = "crdownload";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

fn browser_err(e: impl std::fmt::Display) -> PortalError {
    PortalError::Browser(e.to_string())
}

/// Launch parameters for a portal session.
#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base_url: String,
    pub headless: bool,
    pub timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&Settings> for PortalSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            base_url: settings.portal_url.clone(),
            headless: settings.headless,
            timeout: settings.portal_timeout,
            idle_timeout: settings.backfill_timeout,
        }
    }
}

/// Starts a fresh Chrome process for every backfill.
pub struct ChromeLauncher {
    settings: PortalSettings,
}

impl ChromeLauncher {
    pub fn new(settings: PortalSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PortalLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn DocumentPortal>, PortalError> {
        let settings = self.settings.clone();
        let portal = tokio::task::spawn_blocking(move || ChromePortal::launch_blocking(settings))
            .await
            .map_err(|e| PortalError::Join(e.to_string()))??;
        Ok(Box::new(portal))
    }
}

pub struct ChromePortal {
    browser: Arc<Browser>,
    tab: Arc<Tab>,
    http: reqwest::Client,
    settings: PortalSettings,
    // Text the last step was searching for; highlighted in debug dumps.
    last_needles: Vec<String>,
    // Held for the whole life of each blocking step, including steps whose
    // caller was cancelled.
    busy: Arc<Mutex<()>>,
}

/// Where a document tile led.
enum Target {
    Link { url: String, cookies: String },
    Saved(DownloadedDocument),
}

impl ChromePortal {
    fn launch_blocking(settings: PortalSettings) -> Result<Self, PortalError> {
        tracing::info!("Launching Chrome (headless: {})", settings.headless);
        // 1. Browser process
        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .sandbox(false)
            .window_size(Some((1440, 900)))
            .idle_browser_timeout(settings.idle_timeout)
            .args(vec![OsStr::new("--disable-dev-shm-usage")])
            .build()
            .map_err(browser_err)?;

        // 2. One tab for the whole session
        let browser = Arc::new(Browser::new(options).map_err(browser_err)?);
        let tab = browser.new_tab().map_err(browser_err)?;
        tab.set_default_timeout(settings.timeout);

        // 3. HTTP client for document fetches, reusing the tab's cookies per request
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            browser,
            tab,
            http,
            settings,
            last_needles: Vec::new(),
            busy: Arc::new(Mutex::new(())),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PortalError>
    where
        F: FnOnce(&Browser, &Tab) -> Result<T, PortalError> + Send + 'static,
        T: Send + 'static,
    {
        let busy = Arc::clone(&self.busy).lock_owned().await;
        let browser = Arc::clone(&self.browser);
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            let _busy = busy;
            f(&browser, &tab)
        })
        .await
            .map_err(|e| PortalError::Join(e.to_string()))?
    }

    async fn fetch(&self, url: &str, cookies: String) -> Result<Option<DownloadedDocument>, PortalError> {
        let mut request = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/pdf,*/*");
        if !cookies.is_empty() {
            request = request.header(header::COOKIE, cookies);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                tracing::warn!("Timed out downloading {}", url);
                return Ok(None);
            }
            Err(e) => return Err(PortalError::Download(e)),
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("HTTP {} downloading {}", status, url);
            return Ok(None);
        }
        let final_url = response.url().to_string();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => {
                tracing::warn!("Timed out reading body of {}", url);
                return Ok(None);
            }
            Err(e) => return Err(PortalError::Download(e)),
        };
        if bytes.is_empty() {
            tracing::warn!("Empty body from {}", url);
            return Ok(None);
        }

        tracing::debug!("Downloaded {} bytes from {}", bytes.len(), final_url);
        Ok(Some(DownloadedDocument { bytes: bytes.to_vec(), source_url: final_url }))
    }
}

#[async_trait]
impl DocumentPortal for ChromePortal {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), PortalError> {
        tracing::info!("Logging in as {}", credentials.email);
        self.last_needles = vec!["Email".to_string(), "Password".to_string(), "Log in".to_string()];
        let login_url = format!("{}/login", self.settings.base_url);
        let credentials = credentials.clone();
        let timeout = self.settings.timeout;

        self.blocking(move |_, tab| {
            // 1. Load the login form
            tab.navigate_to(&login_url).map_err(browser_err)?;
            tab.wait_until_navigated().map_err(browser_err)?;

            // 2. Fill and submit
            fill(tab, &locators::email_input(), &credentials.email, timeout)?;
            fill(tab, &locators::password_input(), &credentials.password, timeout)?;
            find_first(tab, &locators::login_button(), timeout)?
                .click()
                .map_err(browser_err)?;
            settle(tab, CLICK_SETTLE_MS)?;

            // Still looking at a password box on the login route means the form bounced us.
            if tab.get_url().contains("/login") && find_now(tab, &locators::password_input()).is_some() {
                return Err(PortalError::Login("still on the login page after submitting".to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn open_company(&mut self, ticker: &str) -> Result<(), PortalError> {
        tracing::info!("Opening company page for {}", ticker);
        let ticker = ticker.to_uppercase();
        self.last_needles = vec![ticker.clone(), "Search".to_string()];
        let timeout = self.settings.timeout;

        self.blocking(move |_, tab| {
            // 1. Search by ticker
            let search = find_first(tab, &locators::search_input(), timeout)?;
            search.click().map_err(browser_err)?;
            clear(&search)?;
            search.type_into(&ticker).map_err(browser_err)?;
            tab.press_key("Enter").map_err(browser_err)?;
            std::thread::sleep(Duration::from_millis(SEARCH_SETTLE_MS));

            // 2. Open the matching result
            let result = find_first(tab, &locators::company_result(&ticker), timeout).map_err(|e| match e {
                PortalError::ElementNotFound(_) => PortalError::CompanyNotFound(ticker.clone()),
                other => other,
            })?;
            result.click().map_err(browser_err)?;
            settle(tab, 0)
        })
        .await
    }

    async fn open_quarter(&mut self, period: Period) -> Result<bool, PortalError> {
        let patterns = period.label_patterns();
        self.last_needles = patterns.clone();

        self.blocking(move |_, tab| {
            let chain = locators::quarter_tile(&patterns);
            let tile = match find_first(tab, &chain, OPTIONAL_ELEMENT_TIMEOUT) {
                Ok(tile) => tile,
                Err(PortalError::ElementNotFound(_)) => {
                    // The label may be split across child nodes; click the innermost
                    // element whose full text carries it.
                    let html = tab.get_content().map_err(browser_err)?;
                    let split = locators::first_visible_pattern(&html, &patterns)
                        .and_then(|seen| find_now(tab, &[Locator::deepest_text(seen)]));
                    match split {
                        Some(tile) => tile,
                        None => {
                            tracing::info!("No quarter tile for {} (tried {:?})", period, patterns);
                            return Ok(false);
                        }
                    }
                }
                Err(e) => return Err(e),
            };
            tile.click().map_err(browser_err)?;
            settle(tab, QUARTER_SETTLE_MS)?;
            tracing::debug!("Opened {}", period);
            Ok(true)
        })
        .await
    }

    async fn download(&mut self, kind: DocumentKind) -> Result<Option<DownloadedDocument>, PortalError> {
        let label = kind.label();
        self.last_needles = vec![label.to_string()];
        let timeout = self.settings.timeout;

        let target = self
            .blocking(move |browser, tab| resolve_document(browser, tab, label, timeout))
            .await?;

        match target {
            Some(Target::Link { url, cookies }) => {
                tracing::info!("Fetching {} from {}", kind, url);
                self.fetch(&url, cookies).await
            }
            Some(Target::Saved(document)) => {
                tracing::info!("Captured {} as a browser download ({} bytes)", kind, document.bytes.len());
                Ok(Some(document))
            }
            None => {
                tracing::info!("No '{}' document on this quarter", label);
                Ok(None)
            }
        }
    }

    async fn capture_debug(&mut self, dir: &Path, tag: &str) -> Result<Vec<PathBuf>, AppError> {
        let (png, html) = self
            .blocking(|_, tab| {
                let png = tab
                    .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                    .map_err(|e| tracing::warn!("Screenshot failed: {}", e))
                    .ok();
                let html = tab
                    .get_content()
                    .map_err(|e| tracing::warn!("Page content unavailable: {}", e))
                    .ok();
                Ok((png, html))
            })
            .await?;

        html_debug::save_page_dump(dir, tag, png.as_deref(), html.as_deref(), &self.last_needles)
    }

    async fn close(&mut self) {
        let _idle = self.busy.lock().await;
        tracing::debug!("Browser session idle, closing");
    }
}

fn cookie_header(tab: &Tab) -> Result<String, PortalError> {
    Ok(tab
        .get_cookies()
        .map_err(browser_err)?
        .into_iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; "))
}

/// Works out where a document tile points. Tries, in order: a link in the
/// page snapshot, the tile's enclosing anchor, and finally clicking the tile
/// and watching for a PDF in a new tab, in the current one, or as a file
/// download.
fn resolve_document(browser: &Browser, tab: &Tab, label: &str, timeout: Duration) -> Result<Option<Target>, PortalError> {
    let link = |url: String| -> Result<Option<Target>, PortalError> {
        Ok(Some(Target::Link { url, cookies: cookie_header(tab)? }))
    };

    // 1. Plain link in the current page
    let page_url = tab.get_url();
    let html = tab.get_content().map_err(browser_err)?;
    if let Some(url) = locators::find_document_link(&html, label, &page_url) {
        return link(url);
    }

    let tile = match find_first(tab, &locators::document_tile(label), OPTIONAL_ELEMENT_TIMEOUT) {
        Ok(tile) => tile,
        Err(PortalError::ElementNotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    // 2. Tile wrapped in an anchor
    let enclosing = tile
        .call_js_fn(
            "function() { const a = this.closest('a[href]'); return a ? a.href : null; }",
            vec![],
            false,
        )
        .map_err(browser_err)?;
    if let Some(href) = enclosing.value.as_ref().and_then(|v| v.as_str()) {
        if let Some(url) = locators::resolve_url(&page_url, href) {
            return link(url);
        }
    }

    // 3. Click it, with downloads routed to a scratch directory
    let download_dir = tempfile::Builder::new().prefix("quartr-download-").tempdir()?;
    tab.call_method(SetDownloadBehavior {
        behavior: SetDownloadBehaviorBehaviorOption::Allow,
        browser_context_id: None,
        download_path: Some(download_dir.path().to_string_lossy().into_owned()),
        events_enabled: None,
    })
    .map_err(browser_err)?;

    let tabs_before = browser.get_tabs().lock().map(|t| t.len()).unwrap_or(0);
    tile.click().map_err(browser_err)?;
    std::thread::sleep(Duration::from_millis(CLICK_SETTLE_MS));

    let opened: Vec<Arc<Tab>> = match browser.get_tabs().lock() {
        Ok(tabs) => tabs.iter().skip(tabs_before).cloned().collect(),
        Err(_) => Vec::new(),
    };
    for new_tab in opened {
        let url = new_tab.get_url();
        if let Err(e) = new_tab.close(true) {
            tracing::debug!("Failed to close popup tab: {}", e);
        }
        if locators::looks_like_pdf(&url) {
            return link(url);
        }
    }

    let current = tab.get_url();
    if current != page_url && locators::looks_like_pdf(&current) {
        let target = link(current)?;
        tab.navigate_to(&page_url).map_err(browser_err)?;
        settle(tab, 0)?;
        return Ok(target);
    }

    if let Some(path) = wait_for_download(download_dir.path(), DOWNLOAD_START_GRACE, timeout)? {
        let bytes = std::fs::read(&path)?;
        tracing::debug!("Download finished: {}", path.display());
        return Ok(Some(Target::Saved(DownloadedDocument { bytes, source_url: page_url })));
    }

    tracing::warn!("'{}' tile did not lead to a PDF", label);
    Ok(None)
}

/// Waits for Chrome to finish a download into `dir`. Gives up after `grace`
/// when nothing has started, or after `timeout` when a partial file never
/// completes.
fn wait_for_download(dir: &Path, grace: Duration, timeout: Duration) -> std::io::Result<Option<PathBuf>> {
    let started = Instant::now();
    loop {
        let mut in_progress = false;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(OsStr::to_str) == Some(PARTIAL_DOWNLOAD_EXT) {
                in_progress = true;
            } else if path.is_file() {
                return Ok(Some(path));
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout || (!in_progress && elapsed >= grace) {
            if in_progress {
                tracing::warn!("Download in {} still incomplete after {:?}", dir.display(), timeout);
            }
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
}

/// First element matched by any locator right now.
fn find_now<'t>(tab: &'t Tab, chain: &[Locator]) -> Option<Element<'t>> {
    chain.iter().find_map(|locator| match locator {
        Locator::Css(selector) => tab.find_element(selector).ok(),
        Locator::XPath(xpath) => tab.find_element_by_xpath(xpath).ok(),
    })
}

/// Polls the whole chain until one locator matches or `timeout` elapses.
fn find_first<'t>(tab: &'t Tab, chain: &[Locator], timeout: Duration) -> Result<Element<'t>, PortalError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(element) = find_now(tab, chain) {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(PortalError::ElementNotFound(locators::describe(chain)));
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
}

fn clear(element: &Element<'_>) -> Result<(), PortalError> {
    element
        .call_js_fn("function() { this.value = ''; }", vec![], false)
        .map_err(browser_err)?;
    Ok(())
}

fn fill(tab: &Tab, chain: &[Locator], text: &str, timeout: Duration) -> Result<(), PortalError> {
    let input = find_first(tab, chain, timeout)?;
    input.click().map_err(browser_err)?;
    clear(&input)?;
    input.type_into(text).map_err(browser_err)?;
    Ok(())
}

fn settle(tab: &Tab, extra_ms: u64) -> Result<(), PortalError> {
    tab.wait_until_navigated().map_err(browser_err)?;
    if extra_ms > 0 {
        std::thread::sleep(Duration::from_millis(extra_ms));
    }
    Ok(())
}
