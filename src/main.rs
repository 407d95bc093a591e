use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use anything_indexd::config::Config;
use anything_indexd::daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "anything-indexd", about = "Desktop filesystem search daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/anything-indexd/config.toml")]
    config: PathBuf,

    /// Working copy of the index; may live on storage that's cleared on
    /// reboot.
    #[arg(long, default_value = "/run/anything-indexd/index")]
    volatile_index_dir: PathBuf,

    /// Durable copy of the index, mirrored from the volatile copy on each
    /// persistent commit and on shutdown.
    #[arg(long, default_value = "/var/lib/anything-indexd/index")]
    persistent_index_dir: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", args.config.display());
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let daemon = match Daemon::new(config, args.config.clone(), args.volatile_index_dir, args.persistent_index_dir).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            return std::process::ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    match daemon.run(shutdown_rx).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon terminated");
            std::process::ExitCode::FAILURE
        }
    }
}
