use clap::Parser;
use std::path::PathBuf;

use dkp_bot::config::Config;
use dkp_bot::{launch, setup_tracing, telemetry};

#[derive(Debug, Parser)]
#[command(name = "dkpbot", version)]
#[command(about = "Guild DKP ledger and auction house driven by chat slash commands")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let telemetry_guard = match &config.telemetry {
        Some(cfg) if !cfg.otlp_endpoint.is_empty() => match telemetry::setup(cfg) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Failed to set up telemetry, continuing without export: {e}");
                setup_tracing();
                None
            }
        },
        _ => {
            setup_tracing();
            None
        }
    };

    let result = launch(config).await;

    // Explicitly drop the telemetry guard before returning so pending spans
    // flush and the exporter's background thread terminates.
    drop(telemetry_guard);

    result
}
