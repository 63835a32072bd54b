use anyhow::Context;
use clap::Parser;
use spectrograph_server::{bootstrap, logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Spectrograph command server
#[derive(Parser, Debug)]
#[command(name = "spectrograph-server", version, about)]
struct Args {
    /// Instrument configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept command connections on
    #[arg(long, default_value = "0.0.0.0:8374")]
    listen: String,

    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Days of log files to keep
    #[arg(long, default_value_t = 7)]
    log_keep_days: i64,

    /// Drive the simulated instrument instead of real hardware
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_logging(args.log_dir.as_deref(), args.log_keep_days)?;

    let config = bootstrap::load_config(args.config.as_deref())?;
    let dispatcher = Arc::new(bootstrap::open_dispatcher(config, args.simulate)?);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Binding {}", args.listen))?;
    tracing::info!("Listening for commands on {}", args.listen);

    tokio::select! {
        result = spectrograph_server::serve(listener, dispatcher.clone()) => {
            result.context("Accepting connections")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            if !bootstrap::drain(dispatcher.status(), SHUTDOWN_TIMEOUT).await {
                tracing::error!("Exiting with a command still running; hardware may need attention");
            }
        }
    }
    Ok(())
}
