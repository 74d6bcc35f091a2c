//! Configuration loading

use std::path::Path;

use anyhow::Result;

use crate::Config;

const CONFIG_PATH_ENV: &str = "FASTIRL_CONFIG_PATH";
const DEFAULT_CONFIG_FILES: [&str; 2] = ["fastirl.yaml", "fastirl.toml"];

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit` (usually a `--config` flag)
/// 2. `FASTIRL_CONFIG_PATH` environment variable
/// 3. ./fastirl.yaml, then ./fastirl.toml
/// 4. Fall back to environment variables only
///
/// Runs before logging is initialized, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .map(str::to_string)
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            DEFAULT_CONFIG_FILES
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| (*p).to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        if let Some(path) = explicit {
            eprintln!("Config file {path} not found, using environment variables");
        }
        Config::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config from environment: {e}"))?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
