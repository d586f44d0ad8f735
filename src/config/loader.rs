use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Prefix for environment overrides, e.g. `GATEWAY__BACKENDS__PRIMARY__URL`.
pub const ENV_PREFIX: &str = "GATEWAY";

/// Load configuration using the config crate.
///
/// Layers, lowest precedence first: built-in defaults, the optional file at
/// `config_path` (YAML, JSON, TOML or INI by extension), then `GATEWAY__*`
/// environment variables. A missing file is not an error so the gateway can
/// run from defaults and environment alone.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    load_with_env(config_path, Environment::with_prefix(ENV_PREFIX))
}

fn load_with_env(config_path: &str, env: Environment) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let defaults = Config::try_from(&GatewayConfig::default())
        .context("Failed to seed default configuration")?;

    let settings = Config::builder()
        .add_source(defaults)
        .add_source(File::new(config_path, format).required(false))
        .add_source(
            env.prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}
