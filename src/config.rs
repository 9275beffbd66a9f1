//! Layered configuration: CLI flags > spec-mandated env vars > config file > defaults.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP facade listens on (e.g. `:8083` or `0.0.0.0:8083`).
    pub bind_addr: String,

    /// Base URL of the image-generation engine (e.g. `http://127.0.0.1:8000`).
    pub engine_address: String,

    /// Directory containing `<workflow_name>.json` engine graph templates.
    pub template_dir: PathBuf,

    /// Directory containing `<workflow_name>.yaml` parameter mapping configs.
    pub config_dir: PathBuf,

    /// Seconds of tracker inactivity before an active prompt is finalized as timed out.
    pub idle_timeout_secs: u64,

    /// Per-request timeout for outbound webhook delivery, in seconds.
    pub webhook_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: ":8083".to_string(),
            engine_address: "http://127.0.0.1:8000".to_string(),
            template_dir: PathBuf::from("templates"),
            config_dir: PathBuf::from("config"),
            idle_timeout_secs: 30,
            webhook_timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Command line arguments (highest priority, applied by the caller via [`Self::merge_cli`])
    /// 2. The spec-mandated environment variables `COMFYLITE_ADDRESS` / `COMFYUI_ADDRESS`
    /// 3. Config file (`comfylite.yaml` in the current directory)
    /// 4. Defaults (lowest priority)
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_builder = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&GatewayConfig::default())?)
            // Add config file from current directory
            .add_source(
                config::File::with_name("comfylite")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );

        let built = config_builder.build()?;
        let mut cfg: GatewayConfig = built.try_deserialize()?;

        // The spec names these two variables directly rather than under a common
        // prefix, so they're layered on top of the config-crate sources by hand.
        if let Ok(addr) = std::env::var("COMFYLITE_ADDRESS") {
            cfg.bind_addr = addr;
        }
        if let Ok(addr) = std::env::var("COMFYUI_ADDRESS") {
            cfg.engine_address = addr;
        }

        Ok(cfg)
    }

    /// Apply CLI overrides on top of a loaded config. CLI flags win when present.
    #[must_use]
    pub fn merge_cli(mut self, cli: &ServeArgs) -> Self {
        if let Some(ref bind_addr) = cli.bind_addr {
            self.bind_addr = bind_addr.clone();
        }
        if let Some(ref engine_address) = cli.engine_address {
            self.engine_address = engine_address.clone();
        }
        if let Some(ref template_dir) = cli.template_dir {
            self.template_dir = template_dir.clone();
        }
        if let Some(ref config_dir) = cli.config_dir {
            self.config_dir = config_dir.clone();
        }
        self
    }
}

/// Command-line overrides for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "comfylite")]
#[command(author = "Armin Graf")]
#[command(version = "0.1.0")]
#[command(
    about = "Control-plane gateway in front of an image-generation engine",
    long_about = None
)]
pub struct ServeArgs {
    /// Address to bind the HTTP facade to (overrides COMFYLITE_ADDRESS)
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Base URL of the image-generation engine (overrides COMFYUI_ADDRESS)
    #[arg(long, value_name = "URL")]
    pub engine_address: Option<String>,

    /// Directory containing workflow templates
    #[arg(long, value_name = "PATH")]
    pub template_dir: Option<PathBuf>,

    /// Directory containing workflow parameter mapping configs
    #[arg(long, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,

    /// Enable verbose (debug-level) logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.bind_addr, ":8083");
        assert_eq!(cfg.engine_address, "http://127.0.0.1:8000");
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let cfg = GatewayConfig::default();
        let cli = ServeArgs {
            bind_addr: Some(":9000".to_string()),
            engine_address: None,
            template_dir: None,
            config_dir: None,
            verbose: false,
        };
        let merged = cfg.merge_cli(&cli);
        assert_eq!(merged.bind_addr, ":9000");
        assert_eq!(merged.engine_address, "http://127.0.0.1:8000");
    }
}
