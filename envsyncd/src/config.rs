use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use envsync_common::CONF_MAP_NAME;
use serde::Deserialize;

use crate::map::{DEFAULT_OPEN_ATTEMPTS, DEFAULT_OPEN_BACKOFF, RetryPolicy};

const DEFAULT_CONFIG_PATH: &str = "/etc/envsync/envsyncd.toml";
const ENV_CONFIG_PATH: &str = "ENVSYNC_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub cgroup: CgroupConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Config file location; `ENVSYNC_CONFIG` overrides the default path.
    pub fn path() -> PathBuf {
        std::env::var_os(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from [`Config::path`]. A missing file yields
    /// defaults; a file that does not parse is an error.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    /// bpffs directory the loader pins its maps into.
    #[serde(default = "default_map_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_map_name")]
    pub name: String,
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    #[serde(default = "default_open_backoff_ms")]
    pub open_backoff_ms: u64,
}

impl MapConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.open_attempts,
            Duration::from_millis(self.open_backoff_ms),
        )
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            dir: default_map_dir(),
            name: default_map_name(),
            open_attempts: default_open_attempts(),
            open_backoff_ms: default_open_backoff_ms(),
        }
    }
}

fn default_map_dir() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/tetragon")
}
fn default_map_name() -> String {
    CONF_MAP_NAME.to_string()
}
fn default_open_attempts() -> u32 {
    DEFAULT_OPEN_ATTEMPTS
}
fn default_open_backoff_ms() -> u64 {
    DEFAULT_OPEN_BACKOFF.as_millis() as u64
}

#[derive(Debug, Deserialize, Clone)]
pub struct CgroupConfig {
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    /// Tracking controllers, most preferred first.
    #[serde(default = "default_controllers")]
    pub controllers: Vec<String>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            proc_root: default_proc_root(),
            controllers: default_controllers(),
        }
    }
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}
fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}
fn default_controllers() -> Vec<String> {
    ["memory", "pids", "cpuset"].map(String::from).to_vec()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    /// Keep running after the first sync and resync on SIGHUP.
    #[serde(default)]
    pub resync_on_sighup: bool,
}
