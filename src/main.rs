//! Claude agent gateway binary
//!
//! Run with: cargo run
//!
//! For help: cargo run -- --help

use clap::Parser;
use claude_agent_gateway::{cli::Cli, run_gateway_with_cli, shutdown_otel};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Serve until SIGINT/SIGTERM, then tear every session down gracefully
    let result = run_gateway_with_cli(&cli, shutdown_signal()).await;

    // Shutdown OpenTelemetry to flush all pending spans
    shutdown_otel();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        eprintln!("\nFor debugging, run with --diagnostic to log to a file.");
        eprintln!("Or use -v/-vv for more verbose logging.");
        std::process::exit(1);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            eprintln!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                eprintln!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => eprintln!("Received SIGINT, shutting down..."),
        () = terminate => eprintln!("Received SIGTERM, shutting down..."),
    }
}
