//! Workspace config files under `<root>/config/`.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::Path;
use tracing::debug;

/// Selects the environment overlay, `config/<env>.toml`.
pub const ENV_VAR: &str = "CONTEXT_BROKER_ENV";

const DEFAULT_ENV: &str = "development";

/// Layer `config/config.toml`, then the environment overlay, onto `builder`.
/// Missing files are skipped.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let env_name = std::env::var(ENV_VAR)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ENV.to_string());
    let config_dir = workspace_root.join("config");

    let layers = [
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", env_name)),
    ];
    Ok(layers.iter().fold(builder, |builder, path| {
        if path.is_file() {
            debug!(config_path = %path.display(), "Adding workspace configuration");
            builder.add_source(File::from(path.as_path()).required(false))
        } else {
            builder
        }
    }))
}
