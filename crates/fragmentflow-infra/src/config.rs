//! Orchestrator configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.fragmentflow/` in
//! production) and deserializes it into [`OrchestratorConfig`]. Falls back to
//! defaults when the file is missing, malformed, or fails validation.

use std::path::Path;

use fragmentflow_types::config::OrchestratorConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults, logged at info.
/// - Unreadable, unparseable or invalid file: defaults, logged at warn.
pub async fn load_config(data_dir: &Path) -> OrchestratorConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %config_path.display(), "no config.toml found, using defaults");
            return OrchestratorConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return OrchestratorConfig::default();
        }
    };

    let config = match toml::from_str::<OrchestratorConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            return OrchestratorConfig::default();
        }
    };

    if let Err(err) = config.validate() {
        tracing::warn!(path = %config_path.display(), error = %err, "invalid config, using defaults");
        return OrchestratorConfig::default();
    }
    config
}
