use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "CAPVID_DATA_DIR";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub transcription: TranscriptionConfig,
    pub burn_in: BurnInConfig,
    pub cors: CorsConfig,
    pub branding: BrandingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Ephemeral working root holding `uploads/` and `processed/`.
    /// Relative paths resolve against the data directory.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub capacity_bytes: u64,
    pub max_upload_bytes: u64,
    /// Capacity-driven eviction stops once usage is at or below
    /// `capacity_bytes * eviction_target_ratio`.
    pub eviction_target_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub sweep_interval_secs: u64,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub whisper_binary: String,
    pub ffmpeg_binary: String,
    /// Whisper language code, or `auto` for detection.
    pub language: String,
    pub threads: u32,
    /// Ordered from most to least capable; the first variant that fits is loaded.
    pub models: Vec<ModelVariantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelVariantConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub min_available_memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BurnInConfig {
    pub ffmpeg_binary: String,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub force_style: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// Empty list means any origin is accepted.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrandingConfig {
    pub download_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            transcription: TranscriptionConfig::default(),
            burn_in: BurnInConfig::default(),
            cors: CorsConfig::default(),
            branding: BrandingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5001,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 250 * MIB,
            max_upload_bytes: 100 * MIB,
            eviction_target_ratio: 0.8,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15 * 60,
            max_age_secs: 60 * 60,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            whisper_binary: "whisper-cli".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            language: "auto".to_string(),
            threads: 4,
            models: vec![
                ModelVariantConfig {
                    name: "base".to_string(),
                    path: PathBuf::from("models/ggml-base.bin"),
                    min_available_memory_mb: 1024,
                },
                ModelVariantConfig {
                    name: "tiny".to_string(),
                    path: PathBuf::from("models/ggml-tiny.bin"),
                    min_available_memory_mb: 0,
                },
            ],
        }
    }
}

impl Default for BurnInConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            force_style: "FontSize=16,PrimaryColour=&H00ffffff,BorderStyle=1,Outline=1,Shadow=1"
                .to_string(),
        }
    }
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            download_prefix: "CapVid".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn eviction_target_bytes(&self) -> u64 {
        let ratio = self.eviction_target_ratio.clamp(0.0, 1.0);
        (self.capacity_bytes as f64 * ratio) as u64
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Model paths in the config are relative to the data directory unless absolute.
    pub fn resolve_paths(mut self, data_dir: &Path) -> Self {
        self.paths.work_dir = resolve_relative_to(data_dir, &self.paths.work_dir);
        for model in &mut self.transcription.models {
            model.path = resolve_relative_to(data_dir, &model.path);
        }
        self
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. CAPVID_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
