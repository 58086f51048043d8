use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

/// What to do with stored link keys when the stack comes up.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    Keep,
    /// Drop them only if the platform reports a user reset request.
    #[default]
    ClearOnUserRequest,
    ClearAlways,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Inquiry window in units of 1.28s.
    pub inquiry_duration: u8,
    pub max_devices: usize,
    pub max_attribute_size: usize,
    pub channel_mtu: u16,
    pub service_mtu: u16,
    /// Channel open statuses that mean the remote forgot our link key.
    pub stale_link_key_statuses: Vec<u8>,
    pub credential_policy: CredentialPolicy,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            inquiry_duration: 5,
            max_devices: 8,
            max_attribute_size: 512,
            channel_mtu: 48,
            service_mtu: 100,
            stale_link_key_statuses: vec![0x66, 0x6A],
            credential_policy: CredentialPolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub thread_ids: bool,
    pub file_and_line: bool,
    pub pretty: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            thread_ids: true,
            file_and_line: true,
            pretty: true,
        }
    }
}

impl LoggingConfig {
    /// Max level for the subscriber. `RUST_LOG` wins over the file when it
    /// holds a plain level name.
    pub fn max_level(&self) -> Level {
        let from_env = std::env::var("RUST_LOG").ok();
        from_env
            .as_deref()
            .and_then(|v| v.parse().ok())
            .or_else(|| self.level.parse().ok())
            .unwrap_or(Level::INFO)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_queue_capacity: usize,
    pub platform_queue_capacity: usize,
    pub stats_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 256,
            platform_queue_capacity: 256,
            stats_interval_secs: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    pub bluetooth: BluetoothConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
}

impl BridgeConfig {
    /// `<config dir>/padbridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("padbridge").join("config.toml"))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    /// Loads `path`, or the default location. A missing file yields the
    /// defaults; a file that exists but does not parse is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            warn!("No config directory available, using defaults");
            return Ok(Self::default());
        };

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
        if !exists {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        debug!("{:?}", config);
        Ok(config)
    }
}
