mod batch;
mod db;
mod grading;
mod ipc;
mod rank;
mod reports;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Academic-record sidecar: newline-delimited JSON requests on stdin,
/// one response per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "classbookd", version, long_about = None)]
struct Cli {
    /// Workspace directory to open at startup (same as `workspace.select`).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `classbookd=trace`. Overrides RUST_LOG.
    #[arg(long = "log-filter")]
    log_filter: Option<String>,

    /// How long a writer waits on another process's lock before failing.
    #[arg(long = "busy-timeout-ms", default_value_t = 5000)]
    busy_timeout_ms: u64,
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());

    let mut state = ipc::AppState::new(Duration::from_millis(cli.busy_timeout_ms));
    if let Some(path) = cli.workspace {
        let conn = db::open_db(&path, state.busy_timeout)?;
        state.workspace = Some(path);
        state.db = Some(conn);
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        busy_timeout_ms = cli.busy_timeout_ms,
        "classbookd ready"
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // Without a parsed request there is no id to echo.
            Err(e) => ipc::err("", "bad_json", e.to_string(), None),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, shutting down");
    Ok(())
}
