//! Command-line argument parsing
//!
//! Container runtimes invoke the plugin through `CNI_*` variables only; the
//! flags below serve operators running the binary by hand.

use clap::Parser;

use crate::config::{NetConf, RoutingConfig};
use crate::error::ConfigError;

/// Command-line arguments structure
#[derive(Parser, Debug)]
#[command(name = "router")]
#[command(about = "Chained CNI plugin reconciling overlay and underlay pod routing")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to a JSON network configuration")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, help = "Set the logging level")]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long, requires = "config", help = "Validate the configuration file and exit")]
    pub validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in JSON format and exit")]
    pub print_default_config: bool,
}

impl CliArgs {
    /// Load and validate the configuration named by `--config`
    pub fn validate(&self) -> Result<RoutingConfig, ConfigError> {
        let path = self.config.as_deref().ok_or_else(|| ConfigError::MissingRequired {
            field: "config".to_string(),
        })?;
        let conf = NetConf::load(path)?;
        RoutingConfig::from_netconf(&conf)
    }
}

/// Print default configuration in JSON format
pub fn print_default_config() -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&NetConf::with_defaults())
        .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
