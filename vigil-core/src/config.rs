use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub streams: StreamsConfig,
    pub monitor: MonitorConfig,
    pub viewers: ViewersConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL disables the coordination store (single-worker mode)
    pub url: String,
    pub key_prefix: String,
    pub op_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "vigil:".to_string(),
            op_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Root directory for per-camera HLS output, shared between workers
    pub directory: String,
    pub ffmpeg_path: String,
    /// Window after spawn in which an exit counts as an immediate failure
    pub immediate_failure_ms: u64,
    /// Graceful-terminate wait before SIGKILL
    pub stop_grace_seconds: u64,
    pub segment_seconds: u32,
    /// Rolling playlist window, in segments
    pub playlist_size: u32,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            directory: "/mnt/media/streams".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            immediate_failure_ms: 500,
            stop_grace_seconds: 5,
            segment_seconds: 2,
            playlist_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_seconds: u64,
    /// Most-recent-segment age beyond which a live stream counts as stalled
    pub stall_threshold_seconds: u64,
    /// Grace window for first-segment production after start
    pub startup_grace_seconds: u64,
    /// TTL on the cross-worker "stream alive" marker
    pub alive_ttl_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            stall_threshold_seconds: 10,
            startup_grace_seconds: 30,
            alive_ttl_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewersConfig {
    /// TTL on each viewer registration; absence of refresh is departure
    pub registration_ttl_seconds: u64,
    /// Delay between the last viewer leaving and the stream stopping
    pub stop_grace_seconds: u64,
}

impl Default for ViewersConfig {
    fn default() -> Self {
        Self {
            registration_ttl_seconds: 300,
            stop_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub lock_hold_ttl_seconds: u64,
    pub lock_wait_seconds: u64,
    pub claim_ttl_minutes: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_hold_ttl_seconds: 10,
            lock_wait_seconds: 5,
            claim_ttl_minutes: 30,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority: environment variables over config
    /// file over defaults.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // VIGIL_REDIS_URL, VIGIL_STREAMS_DIRECTORY, etc.
        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.streams.directory.is_empty() {
            errors.push("streams.directory must not be empty".to_string());
        }
        if self.streams.segment_seconds == 0 {
            errors.push("streams.segment_seconds must be positive".to_string());
        }
        if self.monitor.tick_seconds == 0 {
            errors.push("monitor.tick_seconds must be positive".to_string());
        }
        if self.viewers.registration_ttl_seconds <= self.viewers.stop_grace_seconds {
            errors.push(
                "viewers.registration_ttl_seconds must exceed viewers.stop_grace_seconds"
                    .to_string(),
            );
        }
        if self.dispatch.claim_ttl_minutes <= 0 {
            errors.push("dispatch.claim_ttl_minutes must be positive".to_string());
        }
        if self.dispatch.lock_hold_ttl_seconds == 0 {
            errors.push("dispatch.lock_hold_ttl_seconds must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. VIGIL_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("VIGIL_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        })
        .or_else(|| {
            let k8s = "/config/config.yaml";
            Path::new(k8s).exists().then(|| k8s.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            Config::default()
        })
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streams.segment_seconds, 2);
        assert_eq!(config.viewers.stop_grace_seconds, 30);
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut config = Config::default();
        config.monitor.tick_seconds = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tick_seconds")));
    }

    #[test]
    fn test_validate_rejects_grace_over_ttl() {
        let mut config = Config::default();
        config.viewers.stop_grace_seconds = 600;
        assert!(config.validate().is_err());
    }
}
