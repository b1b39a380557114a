// src/storage/mod.rs
pub mod local;
pub mod supabase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::quartr::models::{DocumentKind, Period};
use crate::utils::error::StorageError;

pub use local::LocalStore;
pub use supabase::SupabaseStore;

pub const EARNINGS_TABLE: &str = "earnings_files";
pub const UPSERT_CONFLICT_KEY: &str = "ticker,year,quarter,file_type,file_format";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Text,
}

/// One row of the `earnings_files` table. Unique on
/// `(ticker, year, quarter, file_type, file_format)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsFileRow {
    pub ticker: String,
    pub year: i32,
    pub quarter: String,
    pub file_type: String,
    pub file_format: FileFormat,
    pub storage_path: Option<String>,
    pub source_url: Option<String>,
    pub text_content: Option<String>,
}

impl EarningsFileRow {
    /// Row pointing at the stored original.
    pub fn pdf(ticker: &str, period: Period, kind: DocumentKind, storage_path: &str, source_url: &str) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            year: period.year,
            quarter: period.quarter.to_string(),
            file_type: kind.file_type().to_string(),
            file_format: FileFormat::Pdf,
            storage_path: Some(storage_path.to_string()),
            source_url: Some(source_url.to_string()),
            text_content: None,
        }
    }

    /// Row carrying the extracted text inline.
    pub fn text(ticker: &str, period: Period, kind: DocumentKind, source_url: &str, text: String) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            year: period.year,
            quarter: period.quarter.to_string(),
            file_type: kind.file_type().to_string(),
            file_format: FileFormat::Text,
            storage_path: None,
            source_url: Some(source_url.to_string()),
            text_content: Some(text),
        }
    }
}

/// Object storage for the PDFs plus the metadata table.
#[async_trait]
pub trait EarningsStore: Send + Sync {
    /// Whether an object already exists at `path`. Lookup failures count as absent.
    async fn file_exists(&self, path: &str) -> bool;

    /// Uploads (overwriting) a PDF at `path`.
    async fn upload_pdf(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Inserts or replaces a row keyed on `UPSERT_CONFLICT_KEY`.
    async fn upsert_row(&self, row: &EarningsFileRow) -> Result<(), StorageError>;
}

/// Splits `a/b/c.pdf` into (`a/b`, `c.pdf`).
pub fn split_parent(path: &str) -> Result<(&str, &str), StorageError> {
    match path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !path.is_empty() => Ok(("", path)),
        _ => Err(StorageError::InvalidPath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quartr::models::Quarter;

    #[test]
    fn test_rows_serialize_with_nulls() {
        let period = Period::new(2023, Quarter::Q1);
        let row = EarningsFileRow::pdf("msft", period, DocumentKind::Transcript, "pdfs/MSFT/2023-Q1/transcript.pdf", "https://x/y.pdf");
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["ticker"], "MSFT");
        assert_eq!(json["quarter"], "Q1");
        assert_eq!(json["file_format"], "pdf");
        assert!(json["text_content"].is_null());

        let text = EarningsFileRow::text("msft", period, DocumentKind::Transcript, "https://x/y.pdf", "hello".into());
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["file_format"], "text");
        assert!(json["storage_path"].is_null());
        assert_eq!(json["text_content"], "hello");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("pdfs/A/2023-Q1/transcript.pdf").unwrap(), ("pdfs/A/2023-Q1", "transcript.pdf"));
        assert_eq!(split_parent("top.pdf").unwrap(), ("", "top.pdf"));
        assert!(split_parent("pdfs/A/").is_err());
        assert!(split_parent("").is_err());
    }
}
