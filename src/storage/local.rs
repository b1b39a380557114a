// src/storage/local.rs
use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::storage::{EarningsFileRow, EarningsStore, FileFormat};
use crate::utils::error::StorageError;

/// Filesystem stand-in for Supabase, used for local runs.
///
/// PDFs land at `{root}/{storage_path}`; rows are written as JSON to
/// `{root}/rows/{TICKER}/{year}-{quarter}/{file_type}.{file_format}.json`,
/// so a second upsert of the same key overwrites the first.
pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    /// Creates a new LocalStore with the specified base directory
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(StorageError::IoError)?;
        }
        Ok(Self { base_dir: base_path })
    }

    /// Resolves a storage key under the root, refusing anything that escapes it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::InvalidPath(key.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    pub fn row_path(&self, row: &EarningsFileRow) -> Result<PathBuf, StorageError> {
        let format = match row.file_format {
            FileFormat::Pdf => "pdf",
            FileFormat::Text => "text",
        };
        self.resolve(&format!(
            "rows/{}/{}-{}/{}.{}.json",
            row.ticker.to_uppercase(),
            row.year,
            row.quarter,
            row.file_type,
            format
        ))
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StorageError::IoError)?;
    }
    fs::write(path, contents).map_err(StorageError::IoError)
}

#[async_trait]
impl EarningsStore for LocalStore {
    async fn file_exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => full.is_file(),
            Err(e) => {
                tracing::warn!("Cannot check existence: {}", e);
                false
            }
        }
    }

    async fn upload_pdf(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        write_file(&full, bytes)?;
        tracing::info!("Saved PDF to {}", full.display());
        Ok(())
    }

    async fn upsert_row(&self, row: &EarningsFileRow) -> Result<(), StorageError> {
        let full = self.row_path(row)?;
        let mut record = serde_json::to_value(row)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        record["updated_at"] = serde_json::Value::String(chrono::Utc::now().to_rfc3339());
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        write_file(&full, json.as_bytes())?;
        tracing::info!("Saved row to {}", full.display());
        Ok(())
    }
}
