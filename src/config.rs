use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::notes_cache::{DEFAULT_NAMESPACE, DEFAULT_TTL_MS};

const CONFIG_FILE_NAME: &str = "config.toml";
const BASE_URL_ENV: &str = "NOTEAI_API_BASE_URL";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub polling: PollingConfig,
    pub cache: CacheConfig,
}

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every endpoint is appended to
    pub base_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Timeout for the health probe in milliseconds
    pub health_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            timeout_ms: 10_000,
            health_timeout_ms: 5_000,
        }
    }
}

/// Recognition polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Delay between status checks in milliseconds
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 2_000 }
    }
}

/// Local notes cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix for the cache keys
    pub namespace: String,
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
    /// Cache directory (empty = default cache dir)
    pub dir: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl_ms: DEFAULT_TTL_MS,
            dir: None,
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("noteai");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default location, creating it if missing,
    /// then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                config.api.base_url = base_url;
            }
        }
        Ok(config)
    }

    /// Load configuration from file, or create default if not exists
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            config
                .validate()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Reject values that would stall polling or the cache
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            bail!("polling.interval_ms must be greater than zero");
        }
        if i64::try_from(self.cache.ttl_ms).is_err() {
            bail!("cache.ttl_ms is too large");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Directory for the notes cache
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match self.cache.dir {
            Some(ref dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => crate::notes_cache::NotesCache::default_dir(),
        }
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.api.timeout_ms, 10_000);
        assert_eq!(config.api.health_timeout_ms, 5_000);
        assert_eq!(config.polling.interval_ms, 2_000);
        assert_eq!(config.cache.namespace, "noteai");
        assert_eq!(config.cache.ttl_ms, 300_000);
        assert!(config.cache.dir.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[api]
base_url = "https://notes.example.com/api/v1"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.api.base_url, "https://notes.example.com/api/v1");
        assert_eq!(config.api.timeout_ms, 10_000);
        assert_eq!(config.polling.interval_ms, 2_000);
        assert_eq!(config.cache.ttl_ms, 300_000);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[api]
base_url = "https://remote/api"
timeout_ms = 3000
health_timeout_ms = 1000

[polling]
interval_ms = 500

[cache]
namespace = "work"
ttl_ms = 60000
dir = "/tmp/noteai-cache"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.api.base_url, "https://remote/api");
        assert_eq!(config.api.timeout_ms, 3000);
        assert_eq!(config.api.health_timeout_ms, 1000);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.cache.namespace, "work");
        assert_eq!(config.cache.ttl_ms, 60000);
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/noteai-cache"));
    }

    #[test]
    fn test_load_from_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = Config::load_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.polling.interval_ms, 2_000);
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.api.base_url, config.api.base_url);
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[polling]\ninterval_ms = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("interval_ms"));
    }

    #[test]
    fn test_oversized_ttl_is_rejected() {
        let mut config = Config::default();
        config.cache.ttl_ms = u64::MAX;
        assert!(config.validate().is_err());

        config.cache.ttl_ms = DEFAULT_TTL_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "this is not valid [[ toml").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
