/// Voltage Gateway entry point
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use voltage_gateway::{logging, Config, Supervisor};

/// High-performance Modbus TCP/RTU gateway and router
#[derive(Parser, Debug)]
#[command(name = "voltage-gateway", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.log) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("starting voltage gateway");

    let supervisor = match Supervisor::from_config(&config) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    supervisor.shutdown();
    match runner.await {
        Ok(Ok(())) => {
            info!("goodbye");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("supervisor stopped with error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("supervisor task panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}
