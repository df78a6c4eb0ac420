pub mod cgroups;
pub mod config;
pub mod confmap;
pub mod error;
pub mod map;
mod report;
#[cfg(test)]
mod testutil;

pub use cgroups::{CgroupFsMagic, DeploymentMode, DetectError, EnvironmentProbe, HostProbe, SubsysInfo};
pub use config::{CgroupConfig, Config, MapConfig, RuntimeConfig};
pub use confmap::{ConfMapSync, DetectionResult, SyncReport};
pub use error::{DetectionStep, SyncError};
pub use map::{ConfMapHandle, ConfMapOpener, PinnedMapOpener, RetryPolicy};
