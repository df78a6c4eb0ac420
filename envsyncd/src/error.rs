use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cgroups::DetectError;

/// The three environment detection steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStep {
    CgroupFsMagic,
    SubsystemIds,
    DeploymentMode,
}

impl DetectionStep {
    pub fn failure_message(self) -> &'static str {
        match self {
            Self::CgroupFsMagic => "Detection of Cgroupfs version failed",
            Self::SubsystemIds => "Detection of Cgroup Subsystem Controllers failed",
            Self::DeploymentMode => "Detection of deployment mode failed",
        }
    }

    /// What is left unknown when this step fails.
    pub fn degraded_capability(self) -> &'static str {
        match self {
            Self::CgroupFsMagic => "Cgroupfs magic is unknown",
            Self::SubsystemIds => "Cgroup Subsystems IDs are unknown",
            Self::DeploymentMode => "Deployment mode is unknown",
        }
    }
}

impl fmt::Display for DetectionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CgroupFsMagic => "cgroupfs magic",
            Self::SubsystemIds => "cgroup subsystem",
            Self::DeploymentMode => "deployment mode",
        })
    }
}

/// Why a synchronization run left advanced cgroup tracking disabled.
///
/// None of these are fatal to the process; callers log and carry on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("conf map {} unavailable after {attempts} attempts", .path.display())]
    MapUnavailable {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("{step} detection failed")]
    Detection {
        step: DetectionStep,
        #[source]
        source: DetectError,
    },
    #[error("failed to update conf map {}", .path.display())]
    UpdateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    #[cfg(test)]
    pub(crate) fn detection_step(&self) -> Option<DetectionStep> {
        match self {
            Self::Detection { step, .. } => Some(*step),
            _ => None,
        }
    }
}
