use crate::download::task::{FileNameTemplate, Quality};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration (saved to config/settings.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub metadata: MetadataConfig,
    pub network: NetworkConfig,
    pub resolver: ResolverConfig,
}

/// Settings the download queue reads on every scheduling pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory songs are written to; enqueue fails while unset
    pub save_path: Option<PathBuf>,
    pub quality: Quality,
    pub max_concurrent: usize,
    pub file_name_template: FileNameTemplate,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            save_path: None,
            quality: Quality::default(),
            max_concurrent: 3,
            file_name_template: FileNameTemplate::default(),
        }
    }
}

impl DownloadConfig {
    /// Concurrency cap with 0 treated as 1
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Sidecar files written after a song finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub embed_cover: bool,
    pub embed_lyric: bool,
    pub embed_lyric_translation: bool,
    pub embed_lyric_romanization: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            embed_cover: true,
            embed_lyric: true,
            embed_lyric_translation: false,
            embed_lyric_romanization: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            connect_timeout_secs: 30,
            timeout_secs: 300,
        }
    }
}

/// Lookup service that maps songs to playable, cover and lyric data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub api_base: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:9763/".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory, falling back to defaults when absent
    pub fn load() -> anyhow::Result<Self> {
        let config_path = crate::util::paths::get_app_config_path()?;
        Self::load_from(&config_path)
    }

    /// Save configuration to the config directory
    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = crate::util::paths::get_app_config_path()?;
        self.save_to(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Application config not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;

        // Atomic write using temp file + rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &content).context("Failed to write temp config file")?;
        std::fs::rename(&temp_path, path).context("Failed to rename temp config file")?;

        tracing::info!("Saved application config to {:?}", path);
        Ok(())
    }
}
