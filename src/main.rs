use clap::Parser;
use sipio::{server_from_file, utils};
use std::path::PathBuf;

use tracing::{error, info};

/// sipio SIP server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SIPIO_CONFIG", default_value = "config/sipio.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, env = "SIPIO_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    info!("Loading configuration from {}", args.config.display());
    let server = server_from_file(&args.config)?;

    if let Err(e) = server.start().await {
        error!("Server failed to start: {}", e);
        error!("Error code: {}", e.error_code());
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = server.stop().await {
        error!("Shutdown error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
