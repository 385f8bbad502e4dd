//! Initialize the configuration directory: create ~/.parley, a default config and the data directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

/// Ensure `parley init` has run (config file and data directory exist).
pub fn require_initialized(config_path: &Path, config: &Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `parley init` first (config file not found: {})",
            config_path.display()
        );
    }
    let data_dir = config::resolve_data_dir(config, config_path);
    if !data_dir.exists() {
        anyhow::bail!(
            "configuration not initialized; run `parley init` first (data directory not found: {})",
            data_dir.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing.
/// - Creates the data directory (from the config, or `data` next to the config file).
///
/// Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("encoding default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let data_dir = config::resolve_data_dir(&config, config_path);
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        log::info!("created data directory at {}", data_dir.display());
    } else {
        log::debug!("data directory already exists at {}, skipping", data_dir.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_config_and_data_dir_and_is_idempotent() {
        let root = std::env::temp_dir().join(format!("parley-init-test-{}", uuid::Uuid::new_v4()));
        let config_path = root.join("config.json");
        let (config, _) = config::load_config(Some(config_path.clone())).unwrap();
        assert!(require_initialized(&config_path, &config).is_err());

        init_config_dir(&config_path).unwrap();
        std::fs::write(&config_path, r#"{"guest":{"tickMs":5}}"#).unwrap();
        init_config_dir(&config_path).unwrap();

        let (config, _) = config::load_config(Some(config_path.clone())).unwrap();
        assert_eq!(config.guest.tick_ms, 5);
        assert!(root.join("data").is_dir());
        assert!(require_initialized(&config_path, &config).is_ok());
        let _ = std::fs::remove_dir_all(&root);
    }
}
