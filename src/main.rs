// src/main.rs
mod backfill;
mod extractors;
mod quartr;
mod server;
mod storage;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use backfill::{BackfillRequest, Backfiller};
use quartr::{ChromeLauncher, PortalSettings};
use storage::{EarningsStore, LocalStore, SupabaseStore};
use utils::config::{Settings, StoreConfig};
use utils::AppError;

/// Earnings document loader: scrapes transcripts, press releases and
/// presentations from Quartr into Supabase.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for screenshots and HTML dumps when a session fails
    #[arg(long, global = true, env = "DEBUG_DIR")]
    debug_dir: Option<PathBuf>,

    /// Store PDFs and rows under this directory instead of Supabase
    #[arg(long, global = true)]
    local_store: Option<PathBuf>,

    /// Show the browser window
    #[arg(long, global = true)]
    headful: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Address to bind, overrides BIND_ADDR
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a single backfill and print the report
    Backfill {
        /// Ticker symbol of the company
        #[arg(short, long)]
        ticker: String,

        /// First fiscal year
        #[arg(long)]
        start_year: i32,

        /// Last fiscal year
        #[arg(long)]
        end_year: i32,

        /// First quarter of the first year
        #[arg(long, default_value = "Q1")]
        start_q: String,

        /// Last quarter of the last year
        #[arg(long, default_value = "Q4")]
        end_q: String,
    },
}

fn build_store(config: &StoreConfig) -> Result<Arc<dyn EarningsStore>, AppError> {
    let store: Arc<dyn EarningsStore> = match config {
        StoreConfig::Supabase(sb) => {
            tracing::info!("Using Supabase storage at {} (bucket {})", sb.url, sb.bucket);
            Arc::new(SupabaseStore::new(sb)?)
        }
        StoreConfig::Local(root) => {
            tracing::info!("Using local storage under {}", root.display());
            Arc::new(LocalStore::new(root)?)
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Setup Logging (reads RUST_LOG env var)
    utils::logging::setup_logging();

    // 2. Parse CLI Arguments and layer them over the environment
    let args = Args::parse();
    tracing::debug!("Parsed args: {:?}", args);

    let mut settings = Settings::from_env(args.local_store.clone())?;
    if args.debug_dir.is_some() {
        settings.debug_dir = args.debug_dir.clone();
    }
    if args.headful {
        settings.headless = false;
    }

    // 3. Wire up storage, browser launcher and the backfiller
    let store = build_store(&settings.store)?;
    let launcher = Arc::new(ChromeLauncher::new(PortalSettings::from(&settings)));
    let backfiller = Arc::new(Backfiller::new(
        launcher,
        store,
        settings.credentials.clone(),
        settings.backfill_timeout,
        settings.debug_dir.clone(),
    ));

    match args.command {
        Command::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| settings.bind_addr.clone());
            server::serve(&addr, server::AppState { backfiller }).await
        }
        Command::Backfill { ticker, start_year, end_year, start_q, end_q } => {
            let request = BackfillRequest { ticker, start_year, end_year, start_q, end_q };
            let report = backfiller.execute(&request).await?;
            let rendered = serde_json::to_string_pretty(&report)
                .map_err(|e| AppError::Config(format!("Failed to render report: {}", e)))?;
            println!("{}", rendered);
            Ok(())
        }
    }
}
