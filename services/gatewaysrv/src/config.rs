//! Configuration loading
//!
//! Layers, lowest priority first: built-in defaults, the config file
//! (TOML/YAML/JSON chosen by extension), `RTUGW_` environment variables
//! (`__` separates nested keys, e.g. `RTUGW_SERIAL__BAUD_RATE`), then
//! command-line overrides.

use std::path::Path;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use rtu_gateway::GatewayConfig;
use tracing::{debug, info};

use crate::error::{GatewaySrvError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RTUGW_";

/// Command-line values that take precedence over every other layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device: Option<String>,
}

/// Load, override and validate the gateway configuration
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<GatewayConfig> {
    load_config_with_prefix(path, ENV_PREFIX, overrides)
}

/// Load with an explicit environment prefix
pub fn load_config_with_prefix(
    path: Option<&Path>,
    env_prefix: &str,
    overrides: &ConfigOverrides,
) -> Result<GatewayConfig> {
    let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(GatewaySrvError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| GatewaySrvError::ConfigError("Invalid file extension".to_string()))?;

        figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(GatewaySrvError::ConfigError(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };
        info!("Config: {}", path.display());
    }

    figment = figment.merge(Env::prefixed(env_prefix).split("__"));

    let mut config: GatewayConfig = figment
        .extract()
        .map_err(|e| GatewaySrvError::ConfigError(format!("Failed to parse config: {}", e)))?;

    if let Some(device) = &overrides.device {
        debug!("Serial device from command line: {}", device);
        config.serial.device = device.clone();
    }

    config.validate()?;
    Ok(config)
}
