use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "winboot.toml";

/// Executables used for each external tool. Bare names resolve through `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub diskutil: String,
    pub hdiutil: String,
    pub rsync: String,
    pub wimlib: String,
    pub osascript: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            diskutil: "diskutil".to_string(),
            hdiutil: "hdiutil".to_string(),
            rsync: "rsync".to_string(),
            wimlib: "wimlib-imagex".to_string(),
            osascript: "osascript".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// FAT32 volume label given to the formatted drive.
    pub volume_label: String,
    /// Upper bound for each split WIM part, in MiB.
    pub split_size_mb: u32,
    /// Pause after formatting so the new volume can mount.
    pub format_settle_ms: u64,
    /// Parent of the scratch directory for split parts. Defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,
    /// Prefix under which attached images appear.
    pub volumes_root: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
    pub tools: ToolPaths,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            volume_label: "WININSTALL".to_string(),
            split_size_mb: 3800,
            format_settle_ms: 2000,
            temp_root: None,
            volumes_root: PathBuf::from("/Volumes"),
            verbose: false,
            json_logs: false,
            tools: ToolPaths::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `WINBOOT_*` environment variables and CLI overrides,
    /// later layers winning.
    pub fn new<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = match file {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WINBOOT_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", path.display()))?;

        if config.split_size_mb == 0 {
            bail!("split_size_mb must be greater than zero");
        }

        Ok(config)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn format_settle(&self) -> Duration {
        Duration::from_millis(self.format_settle_ms)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
