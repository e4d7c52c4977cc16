//! Command-line arguments and startup helpers

use std::ops::RangeInclusive;
use std::path::PathBuf;

use clap::Parser;
use rtu_gateway::constants::MAX_SLAVE_ADDRESS;
use rtu_gateway::GatewayConfig;
use tracing::info;

use crate::config::ConfigOverrides;

/// Modbus RTU to Modbus TCP/UDP gateway
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gatewaysrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus RTU to Modbus TCP/UDP gateway",
    long_about = None
)]
pub struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long, env = "RTUGW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Serial device, overrides the configuration file
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Scan a slave address range at startup, e.g. 1-247
    #[arg(long, value_parser = parse_scan_range)]
    pub scan: Option<RangeInclusive<u8>>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
        }
    }
}

/// Parse `FIRST-LAST` (or a single address) into a slave address range
pub fn parse_scan_range(value: &str) -> Result<RangeInclusive<u8>, String> {
    let parse = |s: &str| -> Result<u8, String> {
        let address: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid slave address '{}'", s.trim()))?;
        if !(1..=MAX_SLAVE_ADDRESS).contains(&address) {
            return Err(format!(
                "slave address {} outside 1-{}",
                address, MAX_SLAVE_ADDRESS
            ));
        }
        Ok(address)
    };

    let (first, last) = match value.split_once('-') {
        Some((first, last)) => (parse(first)?, parse(last)?),
        None => {
            let address = parse(value)?;
            (address, address)
        },
    };
    if first > last {
        return Err(format!("empty scan range {}-{}", first, last));
    }
    Ok(first..=last)
}

/// Log the effective settings once at startup
pub fn log_startup(config: &GatewayConfig) {
    info!(
        "gatewaysrv v{}: {} @ {} {}",
        env!("CARGO_PKG_VERSION"),
        config.serial.device,
        config.serial.baud_rate,
        config.serial.format
    );
    info!(
        "Timing: delay {}ms, timeout {}ms, {} attempts",
        config.inter_frame_delay_ms, config.response_timeout_ms, config.attempts
    );
    info!(
        "Listen: {}:{} tcp, {}:{} udp, {}",
        config.bind_address,
        config.tcp_port,
        config.bind_address,
        config.udp_port,
        if config.rtu_over_tcp {
            "RTU over TCP"
        } else {
            "MBAP"
        }
    );
}
