//! Controller configuration.
//!
//! Global settings (project, ordered zone list, per-zone capacity, lookback
//! window, live-delete flag, machine shape) plus one [`GroupConfig`] per
//! logical instance group. Loaded from a JSON file, then optionally
//! overridden from the environment.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use spot_proto::{ImageRef, LookbackWindow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/spotctl/config.json";

pub const ENV_PROJECT: &str = "SPOTCTL_PROJECT";
pub const ENV_LIVE_DELETE: &str = "SPOTCTL_LIVE_DELETE";
pub const ENV_CAPACITY_PER_ZONE: &str = "SPOTCTL_CAPACITY_PER_ZONE";

/// Longest accepted operation-history window, in days.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode config: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ─── Group config ─────────────────────────────────────────────────────────────

/// Job settings shared by every instance of one logical group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// IANA timezone the job computes its run dates in.
    pub timezone: String,
    /// Output storage location, e.g. `gs://bucket/site`.
    pub bucket_uri: String,
    pub docker_image: String,
    pub site_name: String,
    /// Scheduled start hour (0-23) in `timezone`.
    pub start_hour: u8,
    /// Days ahead of today this group forecasts for.
    #[serde(default)]
    pub day_offset: u32,
    /// Run budget. Absent means the over-budget rule never fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_seconds: Option<u64>,
}

// ─── Controller config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Provider project id
    pub project: String,

    /// Deployment zones. Order is the zone balancer's tie-break order.
    pub zones: Vec<String>,

    #[serde(default = "default_capacity")]
    pub capacity_per_zone: u32,

    #[serde(default = "default_lookback")]
    pub lookback_days: u32,

    /// Delete completed instances instead of only reporting them.
    #[serde(default)]
    pub live_delete: bool,

    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    #[serde(default)]
    pub boot_image: ImageRef,

    #[serde(default = "default_disk_size")]
    pub disk_size_gb: u32,

    #[serde(default = "default_scopes")]
    pub service_account_scopes: Vec<String>,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

fn default_capacity() -> u32 {
    3
}

fn default_lookback() -> u32 {
    7
}

fn default_machine_type() -> String {
    "n1-highcpu-16".to_string()
}

fn default_disk_size() -> u32 {
    20
}

fn default_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/devstorage.read_write".to_string(),
        "https://www.googleapis.com/auth/logging.write".to_string(),
    ]
}

impl ControllerConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), groups = config.groups.len(), "loaded controller config");
        Ok(config)
    }

    /// Load, apply environment overrides, validate.
    pub fn load_with_env(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(write_err)
    }

    /// Override selected settings from `lookup` (normally the process
    /// environment). Unset keys leave the file value alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(project) = lookup(ENV_PROJECT) {
            self.project = project;
        }
        if let Some(raw) = lookup(ENV_LIVE_DELETE) {
            self.live_delete = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{ENV_LIVE_DELETE} must be a boolean, got {raw:?}"
                    )));
                }
            };
        }
        if let Some(raw) = lookup(ENV_CAPACITY_PER_ZONE) {
            self.capacity_per_zone = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "{ENV_CAPACITY_PER_ZONE} must be a non-negative integer, got {raw:?}"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project is empty".into()));
        }
        if self.zones.is_empty() {
            return Err(ConfigError::Invalid("zones must list at least one zone".into()));
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::Invalid("lookback_days must be at least 1".into()));
        }
        if self.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(ConfigError::Invalid(format!(
                "lookback_days {} exceeds the maximum of {MAX_LOOKBACK_DAYS}",
                self.lookback_days
            )));
        }
        for (name, group) in &self.groups {
            if group.start_hour > 23 {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: start_hour {} is not an hour of the day",
                    group.start_hour
                )));
            }
            if group.max_run_seconds == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: max_run_seconds must be positive or omitted"
                )));
            }
        }
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    pub fn lookback(&self) -> LookbackWindow {
        LookbackWindow::days(self.lookback_days)
    }

    /// A filled-in example written by `spotctl init-config`.
    pub fn sample() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            "rasp-blipmap-bayarea-4k".to_string(),
            GroupConfig {
                timezone: "America/Los_Angeles".to_string(),
                bucket_uri: "gs://wrf-blipmaps/bayarea-4k".to_string(),
                docker_image: "gcr.io/wrf-blipmaps/rasp-bayarea-4k:latest".to_string(),
                site_name: "PANOCHE".to_string(),
                start_hour: 7,
                day_offset: 0,
                max_run_seconds: Some(3 * 3600),
            },
        );
        Self {
            project: "wrf-blipmaps".to_string(),
            zones: vec!["us-west1-a".to_string(), "us-west1-b".to_string()],
            groups,
            ..Self::default()
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zones: Vec::new(),
            capacity_per_zone: default_capacity(),
            lookback_days: default_lookback(),
            live_delete: false,
            machine_type: default_machine_type(),
            boot_image: ImageRef::default(),
            disk_size_gb: default_disk_size(),
            service_account_scopes: default_scopes(),
            groups: BTreeMap::new(),
        }
    }
}
