//! Host cgroup environment collaborators.
//!
//! The synchronizer only talks to [`EnvironmentProbe`]. [`HostProbe`] is the
//! thin production implementation: it reads `statfs(2)` on the cgroup mount,
//! `/proc/cgroups` and `/proc/self/cgroup`, and nothing else.

mod deploy;
mod magic;
mod subsys;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::CgroupConfig;

pub use deploy::classify_deployment;
pub use magic::classify_magic;
pub use subsys::{CgroupSubsys, parse_proc_cgroups, select_tracked};

const KUBERNETES_ENV: &str = "KUBERNETES_SERVICE_HOST";

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("statfs {} failed", .path.display())]
    Statfs {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("unknown cgroup filesystem magic {magic:#x} at {}", .path.display())]
    UnknownMagic { path: PathBuf, magic: u64 },
    #[error("malformed {what}: {detail:?}")]
    Parse { what: &'static str, detail: String },
    #[error("no tracked cgroup controller among {0:?}")]
    NoTrackedController(Vec<String>),
}

/// Which cgroup model the host mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupFsMagic {
    /// cgroup v1, controllers on their own hierarchies.
    Legacy,
    /// cgroup v2, single default hierarchy.
    Unified,
}

impl CgroupFsMagic {
    pub const CGROUP_SUPER_MAGIC: u64 = 0x0027_e0eb;
    pub const CGROUP2_SUPER_MAGIC: u64 = 0x6367_7270;

    pub fn magic(self) -> u64 {
        match self {
            Self::Legacy => Self::CGROUP_SUPER_MAGIC,
            Self::Unified => Self::CGROUP2_SUPER_MAGIC,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Unified => "unified",
        }
    }
}

impl fmt::Display for CgroupFsMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The controller used for tracking and where the kernel keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsysInfo {
    pub controller: String,
    pub hierarchy_id: u32,
    pub subsys_idx: u32,
}

/// Orchestration context of the host. Reported, never published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeploymentMode {
    #[serde(rename = "kubernetes")]
    Kubernetes,
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "systemd service")]
    SystemdService,
    #[serde(rename = "standalone")]
    Standalone,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Container => "container",
            Self::SystemdService => "systemd service",
            Self::Standalone => "standalone",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection primitives consumed by the synchronizer, called in declaration
/// order.
pub trait EnvironmentProbe {
    fn detect_cgroupfs_magic(&self) -> Result<CgroupFsMagic, DetectError>;

    /// Locate the tracked controller. Must run before anything inspects
    /// per-task cgroup membership.
    fn discover_subsys(&self, magic: CgroupFsMagic) -> Result<SubsysInfo, DetectError>;

    fn detect_deployment_mode(&self) -> Result<DeploymentMode, DetectError>;
}

#[derive(Debug, Clone)]
pub struct HostProbe {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    controllers: Vec<String>,
    kubernetes_env: bool,
}

impl HostProbe {
    pub fn new(
        cgroup_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        controllers: Vec<String>,
    ) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            controllers,
            kubernetes_env: std::env::var_os(KUBERNETES_ENV).is_some(),
        }
    }

    pub fn from_config(cfg: &CgroupConfig) -> Self {
        Self::new(&cfg.root, &cfg.proc_root, cfg.controllers.clone())
    }

    /// Override what the process environment said about Kubernetes.
    pub fn with_kubernetes_env(mut self, present: bool) -> Self {
        self.kubernetes_env = present;
        self
    }
}

impl EnvironmentProbe for HostProbe {
    fn detect_cgroupfs_magic(&self) -> Result<CgroupFsMagic, DetectError> {
        magic::detect(&self.cgroup_root, &self.controllers)
    }

    fn discover_subsys(&self, magic: CgroupFsMagic) -> Result<SubsysInfo, DetectError> {
        let contents = read_proc(&self.proc_root.join("cgroups"))?;
        let table = parse_proc_cgroups(&contents)?;
        select_tracked(&table, &self.controllers, magic)
    }

    fn detect_deployment_mode(&self) -> Result<DeploymentMode, DetectError> {
        if self.kubernetes_env {
            return Ok(DeploymentMode::Kubernetes);
        }
        let contents = read_proc(&self.proc_root.join("self").join("cgroup"))?;
        classify_deployment(&contents)
    }
}

fn read_proc(path: &Path) -> Result<String, DetectError> {
    fs::read_to_string(path).map_err(|source| DetectError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROC_CGROUPS_V2: &str = "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
cpuset\t0\t52\t1\n\
cpu\t0\t52\t1\n\
cpuacct\t0\t52\t1\n\
blkio\t0\t52\t1\n\
memory\t0\t52\t1\n\
devices\t0\t52\t1\n\
freezer\t0\t52\t1\n\
net_cls\t0\t52\t1\n\
perf_event\t0\t52\t1\n\
net_prio\t0\t52\t1\n\
hugetlb\t0\t52\t1\n\
pids\t0\t52\t1\n";

    fn fake_proc(cgroups: &str, self_cgroup: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroups"), cgroups).unwrap();
        fs::create_dir(dir.path().join("self")).unwrap();
        fs::write(dir.path().join("self").join("cgroup"), self_cgroup).unwrap();
        dir
    }

    fn probe(proc_root: &Path) -> HostProbe {
        HostProbe::new("/sys/fs/cgroup", proc_root, CgroupConfig::default().controllers)
            .with_kubernetes_env(false)
    }

    #[test]
    fn discovers_memory_controller_from_proc() {
        let proc = fake_proc(PROC_CGROUPS_V2, "0::/system.slice/envsyncd.service\n");
        let info = probe(proc.path())
            .discover_subsys(CgroupFsMagic::Unified)
            .unwrap();
        assert_eq!(
            info,
            SubsysInfo {
                controller: "memory".into(),
                hierarchy_id: 0,
                subsys_idx: 4,
            }
        );
    }

    #[test]
    fn deployment_mode_reads_self_cgroup() {
        let proc = fake_proc(PROC_CGROUPS_V2, "0::/system.slice/envsyncd.service\n");
        assert_eq!(
            probe(proc.path()).detect_deployment_mode().unwrap(),
            DeploymentMode::SystemdService
        );
    }

    #[test]
    fn kubernetes_env_wins_over_cgroup_path() {
        let proc = fake_proc(PROC_CGROUPS_V2, "0::/\n");
        let mode = probe(proc.path())
            .with_kubernetes_env(true)
            .detect_deployment_mode()
            .unwrap();
        assert_eq!(mode, DeploymentMode::Kubernetes);
    }

    #[test]
    fn missing_proc_files_are_io_errors() {
        let empty = TempDir::new().unwrap();
        let probe = probe(empty.path());
        match probe.discover_subsys(CgroupFsMagic::Unified) {
            Err(DetectError::Io { path, .. }) => assert!(path.ends_with("cgroups")),
            other => panic!("expected io error, got {other:?}"),
        }
        assert!(matches!(
            probe.detect_deployment_mode(),
            Err(DetectError::Io { .. })
        ));
    }

    #[test]
    fn names_match_kernel_vocabulary() {
        assert_eq!(CgroupFsMagic::Unified.to_string(), "unified");
        assert_eq!(CgroupFsMagic::Legacy.magic(), 0x27e0eb);
        assert_eq!(DeploymentMode::SystemdService.to_string(), "systemd service");
        assert_eq!(
            serde_json::to_value(DeploymentMode::Kubernetes).unwrap(),
            "kubernetes"
        );
    }
}
