// src/quartr/mod.rs
pub mod locators;
pub mod models;
pub mod session;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::utils::config::Credentials;
use crate::utils::error::{AppError, PortalError};
use models::{DocumentKind, DownloadedDocument, Period};

pub use session::{ChromeLauncher, PortalSettings};

/// One logged-in browsing session on the earnings portal.
///
/// Calls are made in order: `login`, `open_company`, then any number of
/// `open_quarter` each followed by `download` per document kind.
#[async_trait]
pub trait DocumentPortal: Send {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), PortalError>;

    async fn open_company(&mut self, ticker: &str) -> Result<(), PortalError>;

    /// Returns `false` when the quarter is not listed for the company.
    async fn open_quarter(&mut self, period: Period) -> Result<bool, PortalError>;

    /// Returns `None` when the open quarter has no such document.
    async fn download(&mut self, kind: DocumentKind) -> Result<Option<DownloadedDocument>, PortalError>;

    /// Best-effort screenshot and HTML dump of the current page.
    async fn capture_debug(&mut self, dir: &Path, tag: &str) -> Result<Vec<PathBuf>, AppError>;

    /// Waits until browser work left running by a cancelled call has
    /// finished. The session is unusable afterwards.
    async fn close(&mut self);
}

/// Produces a fresh portal session per backfill.
#[async_trait]
pub trait PortalLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn DocumentPortal>, PortalError>;
}
