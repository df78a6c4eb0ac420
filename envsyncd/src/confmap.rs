//! Publishes the detected cgroup environment into the BPF conf map.
//!
//! A run opens the pinned map (retrying while the loader may still be pinning
//! it), detects the cgroupfs magic, the tracked cgroup subsystem and the
//! deployment mode, then writes one `ConfKey`/`ConfValue` pair. Probes that
//! already run read key 0 at event time, so a failed run leaves whatever was
//! there before untouched and only disables advanced cgroup tracking.

use std::path::{Path, PathBuf};
use std::time::Duration;

use envsync_common::{CONF_MAP_NAME, ConfKey, ConfValue};
use log::kv::Value;
use log::{Level, Log};
use serde::Serialize;

use crate::cgroups::{CgroupFsMagic, DeploymentMode, DetectError, EnvironmentProbe, SubsysInfo};
use crate::error::{DetectionStep, SyncError};
use crate::map::{self, ConfMapHandle, ConfMapOpener, RetryPolicy};
use crate::report::SyncLog;

/// What one run learned about the host. Never cached between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub magic: CgroupFsMagic,
    pub subsys: SubsysInfo,
    pub deployment: DeploymentMode,
}

impl DetectionResult {
    /// The record published for this result; detected ids pass through as-is.
    pub fn conf_value(&self) -> ConfValue {
        ConfValue::new(self.subsys.hierarchy_id, self.subsys.subsys_idx)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub map_path: PathBuf,
    pub nspid: u32,
    pub key: ConfKey,
    pub value: ConfValue,
    pub magic: CgroupFsMagic,
    pub controller: String,
    pub deployment: DeploymentMode,
}

pub struct ConfMapSync<'l, P, O, S = fn(Duration)> {
    logger: &'l dyn Log,
    probe: P,
    opener: O,
    pause: S,
    retry: RetryPolicy,
    map_name: String,
}

impl<'l, P, O> ConfMapSync<'l, P, O>
where
    P: EnvironmentProbe,
    O: ConfMapOpener,
{
    /// Synchronizer writing to `tg_conf_map`, retrying with the default
    /// policy and sleeping the calling thread between attempts.
    pub fn new(logger: &'l dyn Log, probe: P, opener: O) -> Self {
        Self {
            logger,
            probe,
            opener,
            pause: std::thread::sleep,
            retry: RetryPolicy::default(),
            map_name: CONF_MAP_NAME.to_string(),
        }
    }
}

impl<'l, P, O, S> ConfMapSync<'l, P, O, S>
where
    P: EnvironmentProbe,
    O: ConfMapOpener,
    S: FnMut(Duration),
{
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_map_name(mut self, name: impl Into<String>) -> Self {
        self.map_name = name.into();
        self
    }

    /// Replace how the retry loop waits between open attempts.
    pub fn with_pause<S2: FnMut(Duration)>(self, pause: S2) -> ConfMapSync<'l, P, O, S2> {
        ConfMapSync {
            logger: self.logger,
            probe: self.probe,
            opener: self.opener,
            pause,
            retry: self.retry,
            map_name: self.map_name,
        }
    }

    pub fn map_path(&self, map_dir: &Path) -> PathBuf {
        map_dir.join(&self.map_name)
    }

    /// Open the map under `map_dir`, detect the environment and publish it.
    /// `nspid` only shows up in the report. Blocks for up to
    /// `RetryPolicy::max_blocking` while waiting for the map.
    pub fn run(&mut self, map_dir: &Path, nspid: u32) -> Result<SyncReport, SyncError> {
        let path = self.map_path(map_dir);
        let log = SyncLog::new(self.logger, &self.map_name);

        let mut handle = map::acquire(&mut self.opener, &path, self.retry, &mut self.pause, &log)?;
        let detected = detect_with(&self.probe, &log)?;
        publish(&mut handle, path, detected, nspid, &log)
    }

    /// Run the detection steps alone, without touching any map.
    pub fn detect(&self) -> Result<DetectionResult, SyncError> {
        detect_with(&self.probe, &SyncLog::new(self.logger, &self.map_name))
    }
}

fn detect_with<P>(probe: &P, log: &SyncLog<'_>) -> Result<DetectionResult, SyncError>
where
    P: EnvironmentProbe + ?Sized,
{
    let magic = probe
        .detect_cgroupfs_magic()
        .map_err(|e| step_failed(log, DetectionStep::CgroupFsMagic, e))?;

    // Must precede anything that looks at per-task cgroup membership.
    let subsys = probe
        .discover_subsys(magic)
        .map_err(|e| step_failed(log, DetectionStep::SubsystemIds, e))?;

    let deployment = probe
        .detect_deployment_mode()
        .map_err(|e| step_failed(log, DetectionStep::DeploymentMode, e))?;

    Ok(DetectionResult {
        magic,
        subsys,
        deployment,
    })
}

fn step_failed(log: &SyncLog<'_>, step: DetectionStep, source: DetectError) -> SyncError {
    log.warn_error(&source, step.failure_message());
    log.warn_degraded(step.degraded_capability());
    SyncError::Detection { step, source }
}

fn publish<H: ConfMapHandle>(
    handle: &mut H,
    map_path: PathBuf,
    detected: DetectionResult,
    nspid: u32,
    log: &SyncLog<'_>,
) -> Result<SyncReport, SyncError> {
    let key = ConfKey::LIVE;
    let value = detected.conf_value();

    if let Err(source) = handle.update(&key, &value) {
        log.warn_error(&source, "Failed to update conf map");
        log.warn_degraded("Update conf map failed");
        return Err(SyncError::UpdateFailed {
            path: map_path,
            source,
        });
    }

    log.emit(
        Level::Info,
        &[
            ("nspid", Value::from(nspid)),
            ("deployment.mode", Value::from(detected.deployment.as_str())),
            ("cgroup.fs.magic", Value::from(detected.magic.as_str())),
            (
                "cgroup.controller.name",
                Value::from(detected.subsys.controller.as_str()),
            ),
            ("cgroup.controller.hierarchyID", Value::from(value.cgrp_hierarchy)),
            ("cgroup.controller.index", Value::from(value.cgrp_subsys_idx)),
        ],
        format_args!("Updated conf map successfully"),
    );

    Ok(SyncReport {
        map_path,
        nspid,
        key,
        value,
        magic: detected.magic,
        controller: detected.subsys.controller,
        deployment: detected.deployment,
    })
}
