use anyhow::{bail, Context, Result};
use mirage_sync::config::duration_ms;
use mirage_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to run one sync root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local directory kept in sync
    pub sync_root: PathBuf,
    /// SQLite file holding item state
    pub state_path: PathBuf,
    /// Debounce applied to local file system events
    #[serde(with = "duration_ms", default = "default_debounce")]
    pub watch_debounce: Duration,
    /// Start the file system watcher with the daemon
    #[serde(default = "default_true")]
    pub watch_local: bool,
    /// Poll the remote change feed between full cycles
    #[serde(default = "default_true")]
    pub watch_remote: bool,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_debounce() -> Duration {
    Duration::from_millis(200)
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    /// Config for `sync_root` with state under the default location
    pub fn for_root(sync_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            sync_root: sync_root.into(),
            state_path: default_state_path()?,
            watch_debounce: default_debounce(),
            watch_local: true,
            watch_remote: true,
            sync: SyncConfig::default(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_root.as_os_str().is_empty() {
            bail!("sync_root must be set");
        }
        if self.state_path.starts_with(&self.sync_root) {
            bail!(
                "state database {} must live outside the sync root",
                self.state_path.display()
            );
        }
        self.sync
            .validate()
            .context("Invalid sync settings")?;
        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Load configuration from the default location
    pub fn load() -> Result<DaemonConfig> {
        Self::load_from(&get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<DaemonConfig> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Check if configuration file exists
    pub fn exists() -> Result<bool> {
        Ok(get_config_path()?.exists())
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".mirage").join("config.toml"))
}

/// Get the default item state database path
pub fn default_state_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".mirage").join("items.sqlite"))
}
