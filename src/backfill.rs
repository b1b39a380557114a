// src/backfill.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::extractors::pdf_to_text;
use crate::quartr::models::{normalize_ticker, storage_path, DocumentKind, FiscalRange, Period, Quarter};
use crate::quartr::{DocumentPortal, PortalLauncher};
use crate::storage::{EarningsFileRow, EarningsStore};
use crate::utils::config::Credentials;
use crate::utils::error::{AppError, RequestError};

// Budget for the failure dump, on top of the backfill watchdog.
const DEBUG_CAPTURE_TIMEOUT: Duration = Duration::from_secs(20);
// How long a timed-out session gets to wind down before the lock is released.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

fn default_start_q() -> String {
    "Q1".to_string()
}

fn default_end_q() -> String {
    "Q4".to_string()
}

/// Body of `POST /backfill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub ticker: String,
    pub start_year: i32,
    pub end_year: i32,
    #[serde(default = "default_start_q")]
    pub start_q: String,
    #[serde(default = "default_end_q")]
    pub end_q: String,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillJob {
    pub ticker: String,
    pub range: FiscalRange,
}

impl BackfillRequest {
    pub fn validate(&self) -> Result<BackfillJob, RequestError> {
        let ticker = normalize_ticker(&self.ticker)?;
        let start_q: Quarter = self.start_q.parse()?;
        let end_q: Quarter = self.end_q.parse()?;
        let range = FiscalRange::new(self.start_year, self.end_year, start_q, end_q)?;
        Ok(BackfillJob { ticker, range })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub period: String,
    pub file_type: String,
    pub storage_path: String,
    pub source_url: String,
    pub bytes: usize,
    /// `None` when text extraction failed and only the PDF row was written.
    pub text_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub ticker: String,
    pub periods_requested: usize,
    pub quarters_opened: usize,
    pub quarters_missing: Vec<String>,
    pub skipped_existing: Vec<String>,
    pub documents_missing: usize,
    pub documents_stored: Vec<StoredDocument>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackfillReport {
    fn new(job: &BackfillJob) -> Self {
        Self {
            ticker: job.ticker.clone(),
            periods_requested: job.range.periods().len(),
            quarters_opened: 0,
            quarters_missing: Vec::new(),
            skipped_existing: Vec::new(),
            documents_missing: 0,
            documents_stored: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Walks every period of the job on an already-launched portal session,
/// storing each document that is not in storage yet.
pub async fn run_backfill(
    portal: &mut dyn DocumentPortal,
    store: &dyn EarningsStore,
    credentials: &Credentials,
    job: &BackfillJob,
) -> Result<BackfillReport, AppError> {
    // 1. Sign in and open the company page
    let mut report = BackfillReport::new(job);
    tracing::info!(
        "Backfilling {} over {} period(s)",
        job.ticker,
        report.periods_requested
    );

    portal.login(credentials).await?;
    portal.open_company(&job.ticker).await?;

    // 2. Walk the periods oldest first
    for period in job.range.periods() {
        if !portal.open_quarter(period).await? {
            tracing::info!("{} {} not listed, skipping", job.ticker, period);
            report.quarters_missing.push(period.to_string());
            continue;
        }
        report.quarters_opened += 1;

        // 3. Fetch every document kind not already in storage
        for kind in DocumentKind::ALL {
            let key = storage_path(&job.ticker, period, kind);
            if store.file_exists(&key).await {
                tracing::debug!("{} already stored", key);
                report.skipped_existing.push(key);
                continue;
            }

            let Some(document) = portal.download(kind).await? else {
                report.documents_missing += 1;
                continue;
            };

            let stored = store_document(store, &job.ticker, period, kind, &key, document.bytes, &document.source_url).await?;
            report.documents_stored.push(stored);
        }
    }

    report.finished_at = Some(Utc::now());
    tracing::info!(
        "Backfill for {} finished: {} stored, {} already present, {} missing documents, {} missing quarters",
        job.ticker,
        report.documents_stored.len(),
        report.skipped_existing.len(),
        report.documents_missing,
        report.quarters_missing.len()
    );
    Ok(report)
}

/// Uploads the PDF and writes its `pdf` row, then the `text` row when
/// extraction succeeds.
async fn store_document(
    store: &dyn EarningsStore,
    ticker: &str,
    period: Period,
    kind: DocumentKind,
    key: &str,
    bytes: Vec<u8>,
    source_url: &str,
) -> Result<StoredDocument, AppError> {
    let size = bytes.len();
    // The PDF goes up first so a failed extraction still leaves it stored
    store.upload_pdf(key, &bytes).await?;

    let text = match pdf_to_text(bytes).await {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("Text extraction failed for {}: {}", key, e);
            None
        }
    };

    store
        .upsert_row(&EarningsFileRow::pdf(ticker, period, kind, key, source_url))
        .await?;

    let text_chars = match text {
        Some(text) => {
            let chars = text.chars().count();
            store
                .upsert_row(&EarningsFileRow::text(ticker, period, kind, source_url, text))
                .await?;
            Some(chars)
        }
        None => None,
    };

    tracing::info!("Stored {} {} {} ({} bytes)", ticker, period, kind, size);
    Ok(StoredDocument {
        period: period.to_string(),
        file_type: kind.file_type().to_string(),
        storage_path: key.to_string(),
        source_url: source_url.to_string(),
        bytes: size,
        text_chars,
    })
}

/// Owns everything a backfill needs and runs one browser session at a time.
pub struct Backfiller {
    launcher: Arc<dyn PortalLauncher>,
    store: Arc<dyn EarningsStore>,
    credentials: Credentials,
    timeout: Duration,
    debug_dir: Option<PathBuf>,
    session_lock: Mutex<()>,
}

impl Backfiller {
    pub fn new(
        launcher: Arc<dyn PortalLauncher>,
        store: Arc<dyn EarningsStore>,
        credentials: Credentials,
        timeout: Duration,
        debug_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            store,
            credentials,
            timeout,
            debug_dir,
            session_lock: Mutex::new(()),
        }
    }

    /// Validates the request, launches a fresh session and runs the backfill
    /// under the watchdog. On failure the page is dumped to the debug
    /// directory, if one is configured.
    pub async fn execute(&self, request: &BackfillRequest) -> Result<BackfillReport, AppError> {
        // 1. Reject bad requests before a browser is started
        let job = request.validate()?;

        // 2. One session at a time. The guard is held until the portal is gone.
        let guard = self.session_lock.lock().await;
        let deadline = tokio::time::Instant::now() + self.timeout;

        // 3. Launch and run under a single watchdog deadline
        let mut portal = tokio::time::timeout_at(deadline, self.launcher.launch())
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_secs()))??;

        let outcome = tokio::time::timeout_at(
            deadline,
            run_backfill(portal.as_mut(), self.store.as_ref(), &self.credentials, &job),
        )
        .await
        .unwrap_or_else(|_| Err(AppError::Timeout(self.timeout.as_secs())));

        // 4. Dump the page for inspection
        if let Err(e) = &outcome {
            tracing::error!("Backfill for {} failed: {}", job.ticker, e);
            self.dump_debug(portal.as_mut(), &job.ticker).await;
        }

        // 5. Let cancelled browser work drain, then drop the browser before unlocking
        if tokio::time::timeout(CLOSE_TIMEOUT, portal.close()).await.is_err() {
            tracing::warn!("Browser session for {} did not wind down within {:?}", job.ticker, CLOSE_TIMEOUT);
        }
        drop(portal);
        drop(guard);
        outcome
    }

    async fn dump_debug(&self, portal: &mut dyn DocumentPortal, ticker: &str) {
        let Some(dir) = &self.debug_dir else { return };
        let tag = format!("{}_failure", ticker);
        match tokio::time::timeout(DEBUG_CAPTURE_TIMEOUT, portal.capture_debug(dir, &tag)).await {
            Ok(Ok(files)) => tracing::info!("Saved {} debug file(s) to {}", files.len(), dir.display()),
            Ok(Err(e)) => tracing::warn!("Failed to capture debug dump: {}", e),
            Err(_) => tracing::warn!("Debug capture gave up after {:?}", DEBUG_CAPTURE_TIMEOUT),
        }
    }
}
