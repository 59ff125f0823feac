//! Initialize the configuration directory: create ~/.threadbot with a default config and system prompt.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::prompt::DEFAULT_SYSTEM_PROMPT;

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with the default settings if missing.
/// - Writes the system prompt file named by the config if missing.
///
/// Existing files are left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config::config_dir(config_path);
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config =
            serde_json::to_string_pretty(&Config::default()).context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let prompt_path = config::resolve_system_prompt_path(&config, config_path);
    if !prompt_path.exists() {
        if let Some(parent) = prompt_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        std::fs::write(&prompt_path, DEFAULT_SYSTEM_PROMPT)
            .with_context(|| format!("writing default system prompt to {}", prompt_path.display()))?;
        log::info!("wrote default system prompt to {}", prompt_path.display());
    } else {
        log::debug!("system prompt already exists at {}, skipping", prompt_path.display());
    }

    Ok(config_dir.to_path_buf())
}
