//! In-memory collaborators for unit tests.

use std::cell::{Ref, RefCell};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;

use envsync_common::{ConfKey, ConfValue};
use log::kv::{self, Key, Value, VisitSource};
use log::{Level, Log, Metadata, Record};

use crate::cgroups::{CgroupFsMagic, DeploymentMode, DetectError, EnvironmentProbe, SubsysInfo};
use crate::map::{ConfMapHandle, ConfMapOpener};

#[derive(Debug, Clone)]
pub struct Captured {
    pub level: Level,
    pub target: String,
    pub module_path: Option<String>,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl Captured {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Message followed by `key=value` pairs, the way env_logger prints it.
    pub fn rendered(&self) -> String {
        let mut out = self.message.clone();
        for (k, v) in &self.fields {
            out.push_str(&format!(" {k}={v}"));
        }
        out
    }
}

#[derive(Default)]
pub struct CaptureLog {
    records: Mutex<Vec<Captured>>,
}

impl CaptureLog {
    pub fn records(&self) -> Vec<Captured> {
        self.records.lock().unwrap().clone()
    }

    pub fn at(&self, level: Level) -> Vec<Captured> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }

    pub fn warnings(&self) -> Vec<Captured> {
        self.at(Level::Warn)
    }

    pub fn infos(&self) -> Vec<Captured> {
        self.at(Level::Info)
    }
}

struct FieldCollector<'a>(&'a mut Vec<(String, String)>);

impl<'kvs> VisitSource<'kvs> for FieldCollector<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
        self.0.push((key.as_str().to_string(), value.to_string()));
        Ok(())
    }
}

impl Log for CaptureLog {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let mut fields = Vec::new();
        record
            .key_values()
            .visit(&mut FieldCollector(&mut fields))
            .unwrap();
        self.records.lock().unwrap().push(Captured {
            level: record.level(),
            target: record.target().to_string(),
            module_path: record.module_path().map(str::to_string),
            message: record.args().to_string(),
            fields,
        });
    }

    fn flush(&self) {}
}

/// Observable state of the fake kernel map.
#[derive(Debug, Default)]
pub struct MapState {
    pub open_attempts: u32,
    pub closed: u32,
    pub updates: u32,
    /// Raw key and value bytes of the last successful update.
    pub entry: Option<(Vec<u8>, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeOpener {
    state: Rc<RefCell<MapState>>,
    fail_opens: u32,
    fail_update: bool,
}

impl FakeOpener {
    /// Fails the first `fail_opens` open calls.
    pub fn failing(fail_opens: u32) -> Self {
        Self {
            fail_opens,
            ..Self::default()
        }
    }

    pub fn rejecting_updates() -> Self {
        Self {
            fail_update: true,
            ..Self::default()
        }
    }

    /// Pre-populate the map as if an earlier run had published `value`.
    pub fn with_entry(self, value: ConfValue) -> Self {
        self.state.borrow_mut().entry = Some((
            ConfKey::LIVE.as_bytes().to_vec(),
            value.as_bytes().to_vec(),
        ));
        self
    }

    pub fn state(&self) -> Ref<'_, MapState> {
        self.state.borrow()
    }

    pub fn published(&self) -> Option<(ConfKey, ConfValue)> {
        let state = self.state.borrow();
        let (key, value) = state.entry.as_ref()?;
        let key = ConfKey {
            key: u32::from_ne_bytes(key.as_slice().try_into().ok()?),
        };
        Some((key, ConfValue::from_bytes(value)?))
    }
}

pub struct FakeMap {
    state: Rc<RefCell<MapState>>,
    fail_update: bool,
}

impl ConfMapHandle for FakeMap {
    fn update(&mut self, key: &ConfKey, value: &ConfValue) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.updates += 1;
        if self.fail_update {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "update rejected",
            ));
        }
        state.entry = Some((key.as_bytes().to_vec(), value.as_bytes().to_vec()));
        Ok(())
    }
}

impl Drop for FakeMap {
    fn drop(&mut self) {
        self.state.borrow_mut().closed += 1;
    }
}

impl ConfMapOpener for FakeOpener {
    type Handle = FakeMap;

    fn open(&mut self, _path: &Path) -> io::Result<FakeMap> {
        let mut state = self.state.borrow_mut();
        state.open_attempts += 1;
        if state.open_attempts <= self.fail_opens {
            return Err(io::Error::new(io::ErrorKind::NotFound, "map not pinned"));
        }
        Ok(FakeMap {
            state: Rc::clone(&self.state),
            fail_update: self.fail_update,
        })
    }
}

/// Probe answering from fixed results; `None` fails the step with a lookup
/// error.
#[derive(Default)]
pub struct FakeProbe {
    pub magic: Option<CgroupFsMagic>,
    pub subsys: Option<SubsysInfo>,
    pub deployment: Option<DeploymentMode>,
    pub calls: RefCell<Vec<&'static str>>,
}

impl FakeProbe {
    pub fn healthy(
        magic: CgroupFsMagic,
        hierarchy_id: u32,
        subsys_idx: u32,
        deployment: DeploymentMode,
    ) -> Self {
        Self {
            magic: Some(magic),
            subsys: Some(SubsysInfo {
                controller: "memory".to_string(),
                hierarchy_id,
                subsys_idx,
            }),
            deployment: Some(deployment),
            calls: RefCell::default(),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }
}

fn lookup_error(path: &str) -> DetectError {
    DetectError::Io {
        path: PathBuf::from(path),
        source: io::Error::new(io::ErrorKind::NotFound, "lookup failed"),
    }
}

impl EnvironmentProbe for FakeProbe {
    fn detect_cgroupfs_magic(&self) -> Result<CgroupFsMagic, DetectError> {
        self.calls.borrow_mut().push("magic");
        self.magic.ok_or_else(|| lookup_error("/sys/fs/cgroup"))
    }

    fn discover_subsys(&self, _magic: CgroupFsMagic) -> Result<SubsysInfo, DetectError> {
        self.calls.borrow_mut().push("subsys");
        self.subsys.clone().ok_or_else(|| lookup_error("/proc/cgroups"))
    }

    fn detect_deployment_mode(&self) -> Result<DeploymentMode, DetectError> {
        self.calls.borrow_mut().push("deployment");
        self.deployment
            .ok_or_else(|| lookup_error("/proc/self/cgroup"))
    }
}
