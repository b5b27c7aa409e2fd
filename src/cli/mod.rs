//! Application configuration.
//!
//! Layered from built-in defaults, an optional TOML file and `GLM_RELAY__*`
//! environment variables (later sources win).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `GLM_RELAY__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "GLM_RELAY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model identifiers advertised on `/v1/models`
    pub models: Vec<String>,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub files: FilesConfig,
    pub video: VideoConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models: [
                "glm-3-turbo",
                "glm-4",
                "glm-4v",
                "glm-4-think",
                "glm-4-zero",
                "glm-4-deepresearch",
                "glm-v1",
                "glm-v1-vision",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            files: FilesConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tracing: TracingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            tracing: TracingConfig::default(),
        }
    }
}

/// Message tracing (JSONL debug log of requests and answers)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub path: String,
    pub omit_system_prompt: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "~/.glm-relay/trace.jsonl".to_string(),
            omit_system_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Assistant used when the model name is not an assistant id
    pub default_assistant_id: String,
    /// Drawing assistant used for image generation
    pub image_assistant_id: String,
    pub token_ttl_secs: u64,
    pub auth_timeout_secs: u64,
    pub video_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub stream_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chatglm.cn".to_string(),
            default_assistant_id: "65940acff94777010aa6b796".to_string(),
            image_assistant_id: "65a232c082ff90a2ad2f15e2".to_string(),
            token_ttl_secs: 3600,
            auth_timeout_secs: 15,
            video_timeout_secs: 30,
            transfer_timeout_secs: 60,
            stream_timeout_secs: 120,
        }
    }
}

impl UpstreamConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.video_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_size_bytes: u64,
    pub video_image_max_width: u32,
    pub video_image_max_height: u32,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            video_image_max_width: 1440,
            video_image_max_height: 960,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            poll_timeout_secs: 600,
        }
    }
}

impl AppConfig {
    /// Get default config path
    /// ~/.glm-relay/config.toml
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".glm-relay").join("config.toml"))
    }

    /// Load configuration from an optional TOML file plus environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Write the default configuration, refusing to overwrite an existing file
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(&AppConfig::default())
            .context("Failed to serialize default config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::from_file(&temp_dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.files.max_size_bytes, 100 * 1024 * 1024);
        assert!(config.models.iter().any(|m| m == "glm-4"));
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[retry]\ndelay_ms = 10\n",
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.retry.delay(), Duration::from_millis(10));
        assert_eq!(config.upstream.stream_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_write_default_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        AppConfig::write_default(&path).unwrap();
        assert!(AppConfig::write_default(&path).is_err());

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.upstream.default_assistant_id, "65940acff94777010aa6b796");
    }
}
