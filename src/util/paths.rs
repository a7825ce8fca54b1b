use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

// Global config directory override (for --config flag and tests)
static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

const CONFIG_DIR_ENV: &str = "TUNEGRAB_CONFIG_DIR";
const APP_DIR_NAME: &str = "tunegrab";

/// Set config directory override (used by --config flag and tests)
pub fn set_config_dir_override(path: Option<PathBuf>) {
    let mut override_path = CONFIG_DIR_OVERRIDE
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *override_path = path;
}

/// Get current config directory override
pub fn get_config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Find config directory by searching in priority order:
/// 1. Override from --config flag or set_config_dir_override() (created when missing)
/// 2. Environment variable TUNEGRAB_CONFIG_DIR
/// 3. User config directory (`~/.config/tunegrab/` on Unix, `%APPDATA%\tunegrab\` on Windows)
/// 4. Current working directory (`./config/`)
///
/// If no config directory is found, creates one in the user config directory.
pub fn find_config_directory() -> Result<PathBuf> {
    if let Some(override_path) = get_config_dir_override() {
        if !override_path.exists() {
            std::fs::create_dir_all(&override_path).with_context(|| {
                format!("Failed to create config directory {:?}", override_path)
            })?;
        }
        tracing::debug!("Using config directory override: {:?}", override_path);
        return Ok(override_path);
    }

    if let Ok(env_path) = std::env::var(CONFIG_DIR_ENV) {
        let env_config = PathBuf::from(env_path);
        if env_config.exists() {
            tracing::debug!("Found config directory from {}: {:?}", CONFIG_DIR_ENV, env_config);
            return Ok(env_config);
        }
    }

    if let Ok(user_config) = get_user_config_dir() {
        if user_config.exists() {
            tracing::debug!("Found config directory at: {:?}", user_config);
            return Ok(user_config);
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let cwd_config = cwd.join("config");
        if cwd_config.exists() {
            tracing::debug!("Found config directory at: {:?}", cwd_config);
            return Ok(cwd_config);
        }
    }

    let user_config = get_user_config_dir()?;
    std::fs::create_dir_all(&user_config).context("Failed to create user config directory")?;
    tracing::info!("Created config directory at: {:?}", user_config);
    Ok(user_config)
}

/// Platform-specific user config directory
fn get_user_config_dir() -> Result<PathBuf> {
    let base_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine user config directory"))?;
    Ok(base_dir.join(APP_DIR_NAME))
}

/// Get absolute path to settings.toml
pub fn get_app_config_path() -> Result<PathBuf> {
    Ok(find_config_directory()?.join("settings.toml"))
}

/// Get absolute path to the persisted download list
pub fn get_queue_path() -> Result<PathBuf> {
    Ok(find_config_directory()?.join("queue.toml"))
}

/// Get absolute path to application-wide logs directory
pub fn get_logs_dir() -> Result<PathBuf> {
    Ok(find_config_directory()?.join(".logs"))
}
