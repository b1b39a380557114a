// src/storage/supabase.rs
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;

use crate::storage::{split_parent, EarningsFileRow, EarningsStore, EARNINGS_TABLE, UPSERT_CONFLICT_KEY};
use crate::utils::config::SupabaseConfig;
use crate::utils::error::StorageError;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;
const LIST_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
struct StorageEntry {
    name: String,
}

/// Supabase Storage + PostgREST client.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self, StorageError> {
        // 1. Service-role key goes on every request, both as apikey and bearer
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_role_key)
            .map_err(|e| StorageError::SerializationError(format!("invalid service key: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_role_key))
            .map_err(|e| StorageError::SerializationError(format!("invalid service key: {}", e)))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        // 2. Build the shared client
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
        })
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path.trim_start_matches('/'))
    }

    fn list_url(&self) -> String {
        format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket)
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, EARNINGS_TABLE)
    }

    async fn list(&self, parent: &str, name: &str) -> Result<Vec<StorageEntry>, StorageError> {
        // Storage has no HEAD for objects, so search the parent folder by name
        let body = serde_json::json!({
            "prefix": parent,
            "search": name,
            "limit": LIST_LIMIT,
            "offset": 0,
        });
        let response = self.client.post(self.list_url()).json(&body).send().await?;
        let response = check_status(response, "storage list").await?;
        Ok(response.json::<Vec<StorageEntry>>().await?)
    }

    /// Sends a request built by `build`, retrying on network errors and 5xx.
    async fn send_with_retry<F>(&self, endpoint: &str, build: F) -> Result<(), StorageError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match build().send().await {
                Ok(resp) => check_status(resp, endpoint).await.map(|_| ()),
                Err(e) => Err(StorageError::Network(e)),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e) => {
                    tracing::warn!("{} attempt {} failed, retrying: {}", endpoint, attempt, e);
                    tokio::time::sleep(Duration::from_millis(BASE_BACKOFF_MS * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(err: &StorageError) -> bool {
    match err {
        StorageError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        StorageError::Http { status, .. } => status.is_server_error(),
        _ => false,
    }
}

async fn check_status(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!("HTTP error status: {} from {}: {}", status, endpoint, body);
    Err(StorageError::Http { status, endpoint: endpoint.to_string(), body })
}

#[async_trait]
impl EarningsStore for SupabaseStore {
    async fn file_exists(&self, path: &str) -> bool {
        let (parent, name) = match split_parent(path) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("Cannot check existence: {}", e);
                return false;
            }
        };
        match self.list(parent, name).await {
            Ok(entries) => entries.iter().any(|entry| entry.name == name),
            Err(e) => {
                tracing::warn!("Listing {} failed, assuming {} is absent: {}", parent, name, e);
                false
            }
        }
    }

    async fn upload_pdf(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let body = bytes.to_vec(); // Owned copy, the builder runs once per attempt
        self.send_with_retry("storage upload", || {
            self.client
                .post(&url)
                .header(CONTENT_TYPE, "application/pdf")
                .header("x-upsert", "true") // Overwrite an existing object
                .body(body.clone())
        })
        .await?;
        tracing::info!("Uploaded {} ({} bytes) to bucket {}", path, bytes.len(), self.bucket);
        Ok(())
    }

    async fn upsert_row(&self, row: &EarningsFileRow) -> Result<(), StorageError> {
        let url = self.table_url();
        let payload = vec![row]; // PostgREST bulk upsert takes an array
        self.send_with_retry("row upsert", || {
            self.client
                .post(&url)
                .query(&[("on_conflict", UPSERT_CONFLICT_KEY)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&payload)
        })
        .await?;
        tracing::debug!(
            "Upserted {} {} {} {} ({:?})",
            row.ticker, row.year, row.quarter, row.file_type, row.file_format
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quartr::models::{DocumentKind, Period, Quarter};
    use wiremock::matchers::{body_json, body_partial_json, header, headers, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> SupabaseStore {
        SupabaseStore::new(&SupabaseConfig {
            url: server.uri(),
            service_role_key: "service-key".to_string(),
            bucket: "earnings".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_exists_checks_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/list/earnings"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .and(body_partial_json(serde_json::json!({"prefix": "pdfs/AAPL/2023-Q1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "transcript.pdf", "id": "1"},
                {"name": "presentation.pdf", "id": "2"}
            ])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(store.file_exists("pdfs/AAPL/2023-Q1/transcript.pdf").await);
        assert!(!store.file_exists("pdfs/AAPL/2023-Q1/press_release.pdf").await);
    }

    #[tokio::test]
    async fn test_file_exists_false_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bucket not found"))
            .mount(&server)
            .await;

        assert!(!store_for(&server).file_exists("pdfs/AAPL/2023-Q1/transcript.pdf").await);
    }

    #[tokio::test]
    async fn test_upload_sends_pdf_with_upsert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/earnings/pdfs/AAPL/2023-Q1/transcript.pdf"))
            .and(header("content-type", "application/pdf"))
            .and(header("x-upsert", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Key": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .upload_pdf("pdfs/AAPL/2023-Q1/transcript.pdf", b"%PDF-1.7")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = store_for(&server)
            .upload_pdf("pdfs/AAPL/2023-Q1/transcript.pdf", b"%PDF")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Http { status, .. } if status.as_u16() == 503));
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .expect(1)
            .mount(&server)
            .await;

        let row = EarningsFileRow::text("AAPL", Period::new(2023, Quarter::Q1), DocumentKind::Transcript, "u", "t".into());
        assert!(store_for(&server).upsert_row(&row).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_row_uses_conflict_key() {
        let server = MockServer::start().await;
        let row = EarningsFileRow::pdf(
            "aapl",
            Period::new(2023, Quarter::Q1),
            DocumentKind::PressRelease,
            "pdfs/AAPL/2023-Q1/press_release.pdf",
            "https://cdn/x.pdf",
        );
        Mock::given(method("POST"))
            .and(path("/rest/v1/earnings_files"))
            .and(query_param("on_conflict", "ticker,year,quarter,file_type,file_format"))
            .and(headers("prefer", vec!["resolution=merge-duplicates", "return=minimal"]))
            .and(body_json(serde_json::json!([{
                "ticker": "AAPL",
                "year": 2023,
                "quarter": "Q1",
                "file_type": "press_release",
                "file_format": "pdf",
                "storage_path": "pdfs/AAPL/2023-Q1/press_release.pdf",
                "source_url": "https://cdn/x.pdf",
                "text_content": null
            }])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server).upsert_row(&row).await.unwrap();
    }
}
