use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use varsync_core::{SessionManager, StoreConfig};
use varsync_server::ServerError;

/// varsyncd - serve a variable store over stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "varsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Idle seconds before a session expires (0 disables)
    #[arg(long)]
    session_ttl: Option<u64>,

    /// History entries kept per variable
    #[arg(long)]
    history_limit: Option<usize>,

    /// Seconds without a heartbeat before an optimizer lock is released (0 disables)
    #[arg(long)]
    lock_timeout: Option<u64>,

    /// Log filter, e.g. `info` or `varsync_core=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn store_config(&self) -> Result<StoreConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)?,
            None => StoreConfig::default(),
        };
        if let Some(ttl) = self.session_ttl {
            config.session_ttl_secs = ttl;
        }
        if let Some(limit) = self.history_limit {
            config.history_limit = limit;
        }
        if let Some(timeout) = self.lock_timeout {
            config.lock_timeout_secs = timeout;
        }
        Ok(config)
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn run(args: Args) -> Result<(), ServerError> {
    let config = args.store_config()?;
    info!(?config, "starting varsyncd");

    let manager = Arc::new(SessionManager::new(config));
    let sweeper = manager.spawn_sweeper();
    let result = varsync_server::serve(manager, tokio::io::stdin(), tokio::io::stdout()).await;
    sweeper.abort();
    result
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
