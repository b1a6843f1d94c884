use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::recovery::RetryPolicy;

/// Persistent link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub transport: TransportSettings,
    pub heartbeat: HeartbeatSettings,
    pub recovery: RecoverySettings,
    pub codec: CodecSettings,
    pub stream: StreamSettings,
    pub command: CommandSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Capacity of each priority lane.
    pub queue_depth: usize,
    pub sync_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    pub period_ms: u64,
    /// Silent window before a miss is counted; must cover several periods.
    pub window_ms: u64,
    pub max_misses: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    pub max_boot_retries: u8,
    pub retry_interval_ms: u64,
    /// How long to wait for the first heartbeat after reset release.
    pub boot_timeout_ms: u64,
    pub max_subscribers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecSettings {
    pub mailbox_capacity: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    pub start_timeout_ms: u64,
    pub playback_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSettings {
    pub sample_rate: u32,
    pub frame_period_ms: u32,
    /// Gates destructive debug commands (remote panic) at runtime.
    pub debug_commands: bool,
    pub panic_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            recovery: RecoverySettings::default(),
            codec: CodecSettings::default(),
            stream: StreamSettings::default(),
            command: CommandSettings::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            sync_timeout_ms: 500,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            period_ms: 100,
            window_ms: 500,
            max_misses: 3,
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_boot_retries: 3,
            retry_interval_ms: 200,
            boot_timeout_ms: 2000,
            max_subscribers: 8,
        }
    }
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 10,
            request_timeout_ms: 1000,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: 500,
            playback_queue_depth: 32,
        }
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            frame_period_ms: 10,
            debug_commands: false,
            panic_delay_ms: 500,
        }
    }
}

impl TransportSettings {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl HeartbeatSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl RecoverySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_boot_retries,
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

impl CodecSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StreamSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transport.queue_depth == 0 {
            anyhow::bail!("transport.queue_depth must be at least 1");
        }
        if self.heartbeat.period_ms == 0 {
            anyhow::bail!("heartbeat.period_ms must be at least 1");
        }
        if self.heartbeat.window_ms < self.heartbeat.period_ms {
            anyhow::bail!("heartbeat.window_ms must cover at least one period");
        }
        if self.heartbeat.max_misses == 0 {
            anyhow::bail!("heartbeat.max_misses must be at least 1");
        }
        if self.recovery.max_boot_retries == 0 {
            anyhow::bail!("recovery.max_boot_retries must be at least 1");
        }
        if self.codec.mailbox_capacity == 0 {
            anyhow::bail!("codec.mailbox_capacity must be at least 1");
        }
        if self.stream.playback_queue_depth == 0 {
            anyhow::bail!("stream.playback_queue_depth must be at least 1");
        }
        if self.command.sample_rate == 0 || self.command.frame_period_ms == 0 {
            anyhow::bail!("command.sample_rate and frame_period_ms must be nonzero");
        }
        Ok(())
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: LinkConfig,
}

impl ConfigManager {
    pub fn with_config(config: LinkConfig) -> Self {
        Self {
            config_path: PathBuf::from("fallback_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self> {
        Self::at(Self::get_config_path()?)
    }

    pub fn at(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_or_create_config(&config_path)?;
        config.validate()?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn get_config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: LinkConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        let config_str = toml::to_string_pretty(&self.config)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(&self.config_path, config_str)
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    fn load_or_create_config(config_path: &PathBuf) -> Result<LinkConfig> {
        if config_path.exists() {
            info!("Loading configuration from: {:?}", config_path);
            let config_str = fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;

            match toml::from_str::<LinkConfig>(&config_str) {
                Ok(config) => {
                    info!("Configuration loaded successfully");
                    Ok(config)
                }
                Err(e) => {
                    warn!("Failed to parse configuration file: {}. Using defaults.", e);
                    let default_config = LinkConfig::default();
                    if let Err(save_err) = Self::save_config_to_path(&default_config, config_path) {
                        error!("Failed to save default configuration: {}", save_err);
                    }
                    Ok(default_config)
                }
            }
        } else {
            info!("No configuration file found. Creating default configuration.");
            let default_config = LinkConfig::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &LinkConfig, path: &PathBuf) -> Result<()> {
        let config_str = toml::to_string_pretty(config)
            .context("Failed to serialize default configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(path, config_str)
            .context("Failed to write default configuration file")?;

        info!("Default configuration saved to: {:?}", path);
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("dsplink")
        } else {
            let home_dir = dirs::home_dir()
                .context("Could not determine home directory")?;
            home_dir.join(".dsplink")
        };

        Ok(config_dir.join("config.toml"))
    }
}
