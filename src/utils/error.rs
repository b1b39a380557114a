// src/utils/error.rs
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Browser failure: {0}")]
    Browser(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("No element matched any of: {0}")]
    ElementNotFound(String),

    #[error("Company not found for ticker {0}")]
    CompanyNotFound(String),

    #[error("Document download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Blocking task failed: {0}")]
    Join(String),

    #[error("Download directory error: {0}")]
    DownloadDir(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Input is not a PDF document ({0} bytes)")]
    NotPdf(usize),

    #[error("PDF text extraction failed: {0}")]
    Pdf(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status} from {endpoint}: {body}")]
    Http {
        status: reqwest::StatusCode,
        endpoint: String,
        body: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

/// Problems with a backfill request itself, before any browser is launched.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("Ticker must be 1-12 characters of letters, digits, '.' or '-', got {0:?}")]
    InvalidTicker(String),

    #[error("Invalid quarter {0:?}, expected Q1-Q4")]
    InvalidQuarter(String),

    #[error("Year {year} is outside the supported range {min}-{max}")]
    YearOutOfRange { year: i32, min: i32, max: i32 },

    #[error("start_year {start} is after end_year {end}")]
    YearsReversed { start: i32, end: i32 },

    #[error("start_q {start} is after end_q {end} within {year}")]
    QuartersReversed { start: String, end: String, year: i32 },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("Portal interaction failed: {0}")]
    Portal(#[from] PortalError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backfill exceeded the {0}s watchdog")]
    Timeout(u64),
}
