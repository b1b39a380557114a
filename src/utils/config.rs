// src/utils/config.rs
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::error::AppError;

pub const DEFAULT_PORTAL_URL: &str = "https://quartr.com";
pub const DEFAULT_BUCKET: &str = "earnings";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

const DEFAULT_BACKFILL_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_PORTAL_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

// Keep the password out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
    pub bucket: String,
}

impl std::fmt::Debug for SupabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseConfig")
            .field("url", &self.url)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Where documents and rows end up.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Supabase(SupabaseConfig),
    Local(PathBuf),
}

/// Runtime settings, read from the environment (and `.env`) and then
/// overridden by command-line flags in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub portal_url: String,
    pub store: StoreConfig,
    pub backfill_timeout: Duration,
    pub portal_timeout: Duration,
    pub debug_dir: Option<PathBuf>,
    pub headless: bool,
    pub bind_addr: String,
}

impl Settings {
    /// Loads `.env` (if present) and reads settings from the process environment.
    pub fn from_env(local_store: Option<PathBuf>) -> Result<Self, AppError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => tracing::debug!("No .env file found"),
            Err(e) => return Err(AppError::Config(format!("Failed to read .env: {}", e))),
        }
        Self::from_lookup(|key| std::env::var(key).ok(), local_store)
    }

    /// Builds settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F, local_store: Option<PathBuf>) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| AppError::Config(format!("{} must be set", key)))
        };

        let credentials = Credentials {
            email: required("QUARTR_EMAIL")?,
            password: required("QUARTR_PASSWORD")?,
        };

        let store = match local_store {
            Some(root) => StoreConfig::Local(root),
            None => StoreConfig::Supabase(SupabaseConfig {
                url: required("SUPABASE_URL")?.trim_end_matches('/').to_string(),
                service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
                bucket: get("SUPABASE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            }),
        };

        let secs = |key: &str, default: u64| -> Result<Duration, AppError> {
            match get(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| AppError::Config(format!("{} must be a number of seconds, got {:?}", key, raw))),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let headless = match get("HEADLESS").as_deref() {
            None => true,
            Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
            Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
            Some(other) => {
                return Err(AppError::Config(format!("HEADLESS must be true or false, got {:?}", other)))
            }
        };

        Ok(Self {
            credentials,
            portal_url: get("QUARTR_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            store,
            backfill_timeout: secs("BACKFILL_TIMEOUT_SECS", DEFAULT_BACKFILL_TIMEOUT_SECS)?,
            portal_timeout: secs("PORTAL_TIMEOUT_SECS", DEFAULT_PORTAL_TIMEOUT_SECS)?,
            debug_dir: get("DEBUG_DIR").map(PathBuf::from),
            headless,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        })
    }
}
