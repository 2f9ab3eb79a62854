use std::path::Path;

use config::{Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::Config;

/// Load configuration from a file, with environment overrides.
///
/// The file format is chosen by extension (YAML by default). Every key can be
/// overridden by an environment variable prefixed with `GATEWAY_`, with `.`
/// replaced by `_`: `GATEWAY_SERVER_PORT=9090` overrides `server.port`.
pub fn load_config(config_path: &str) -> Result<Config> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = config::Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix("GATEWAY")
                .separator("_")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let cfg: Config = settings.try_deserialize().with_context(|| {
        format!("Failed to deserialize config from {}", path.display())
    })?;

    Ok(cfg)
}
