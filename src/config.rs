use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub background: BackgroundConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAI,
    LmStudio,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: ProviderType,

    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_provider_model")]
    pub model: String,

    /// Falls back to `MEMORA_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Replaces the built-in short caption prompt.
    #[serde(default)]
    pub short_prompt: Option<String>,

    /// Replaces the built-in detailed caption prompt.
    #[serde(default)]
    pub detailed_prompt: Option<String>,
}

impl ProviderConfig {
    /// API key from the config file or the environment, ignoring blanks.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("MEMORA_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_provider_model() -> String {
    "gpt-4o".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::default(),
            endpoint: default_provider_endpoint(),
            model: default_provider_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            short_prompt: None,
            detailed_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories the scanner treats as the media library.
    #[serde(default = "default_library_roots")]
    pub roots: Vec<PathBuf>,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Assets fetched from the source per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum new images accepted by one scan.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

fn default_library_roots() -> Vec<PathBuf> {
    dirs::picture_dir().into_iter().collect()
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "webp".to_string(),
        "heic".to_string(),
    ]
}

fn default_page_size() -> usize {
    20
}

fn default_scan_batch_size() -> usize {
    50
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            roots: default_library_roots(),
            image_extensions: default_image_extensions(),
            page_size: default_page_size(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pause between consecutive provider calls.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,

    /// Total provider attempts per image, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles for each further one.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl WorkerConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

fn default_rate_limit_delay_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_enabled")]
    pub enabled: bool,

    /// Requested wake-up interval; the scheduler enforces its own floor.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

fn default_background_enabled() -> bool {
    true
}

fn default_min_interval_secs() -> u64 {
    15 * 60
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: default_background_enabled(),
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memora")
        .join("memora.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            provider: ProviderConfig::default(),
            library: LibraryConfig::default(),
            worker: WorkerConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memora")
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MEMORA_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
