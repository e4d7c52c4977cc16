//! Modbus RTU to Modbus TCP/UDP gateway

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gatewaysrv::bootstrap::{log_startup, Args};
use gatewaysrv::config::load_config;
use gatewaysrv::logging::init_logging;
use gatewaysrv::run_service;
use gatewaysrv::shutdown::spawn_signal_listener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref(), &args.overrides())
        .context("Failed to load configuration")?;
    let _log_guard = init_logging(&args.log_level, !args.no_color, config.log_dir.as_deref())
        .context("Failed to initialize logging")?;
    log_startup(&config);

    // Validation mode: validate and exit
    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let token = CancellationToken::new();
    let _signals = spawn_signal_listener(token.clone());

    run_service(config, args.scan, token)
        .await
        .context("Gateway stopped with an error")?;

    info!("gatewaysrv stopped");
    Ok(())
}
