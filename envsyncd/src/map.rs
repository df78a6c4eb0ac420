//! Access to the pinned configuration map.

use std::io;
use std::path::Path;
use std::time::Duration;

use aya::Pod;
use aya::maps::{Array, Map, MapData};
use envsync_common::{ConfKey, ConfValue};
use log::Level;
use log::kv::Value;

use crate::error::SyncError;
use crate::report::SyncLog;

/// Total open attempts before giving up on the map.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 7;

/// Pause between two consecutive failed open attempts.
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry for opening a map that a concurrently starting loader may
/// not have pinned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// `attempts` counts every open call, the first one included. Values
    /// below one are raised to one.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Longest time `acquire` can block: no pause follows the last attempt.
    pub fn max_blocking(&self) -> Duration {
        self.backoff * (self.attempts - 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_ATTEMPTS, DEFAULT_OPEN_BACKOFF)
    }
}

/// An open map. Dropping the handle closes it.
pub trait ConfMapHandle {
    /// Write the whole value at `key` in one update call.
    fn update(&mut self, key: &ConfKey, value: &ConfValue) -> io::Result<()>;
}

pub trait ConfMapOpener {
    type Handle: ConfMapHandle;

    fn open(&mut self, path: &Path) -> io::Result<Self::Handle>;
}

#[repr(transparent)]
#[derive(Copy, Clone)]
struct ConfValuePod(ConfValue);

unsafe impl Pod for ConfValuePod {}

/// A pinned `BPF_MAP_TYPE_ARRAY` holding the conf record.
pub struct PinnedConfMap {
    array: Array<MapData, ConfValuePod>,
}

impl ConfMapHandle for PinnedConfMap {
    fn update(&mut self, key: &ConfKey, value: &ConfValue) -> io::Result<()> {
        self.array
            .set(key.key, ConfValuePod(*value), 0)
            .map_err(io::Error::other)
    }
}

/// Opens maps pinned on bpffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedMapOpener;

impl ConfMapOpener for PinnedMapOpener {
    type Handle = PinnedConfMap;

    fn open(&mut self, path: &Path) -> io::Result<PinnedConfMap> {
        let data = MapData::from_pin(path).map_err(io::Error::other)?;
        // Array::new checks the kernel's value size against ConfValue.
        let array = Array::try_from(Map::Array(data)).map_err(io::Error::other)?;
        Ok(PinnedConfMap { array })
    }
}

/// Open `path`, retrying per `policy`. `pause` is called between failed
/// attempts only.
pub(crate) fn acquire<O, P>(
    opener: &mut O,
    path: &Path,
    policy: RetryPolicy,
    pause: &mut P,
    log: &SyncLog<'_>,
) -> Result<O::Handle, SyncError>
where
    O: ConfMapOpener,
    P: FnMut(Duration),
{
    let mut attempt = 1;
    loop {
        match opener.open(path) {
            Ok(handle) => {
                if attempt > 1 {
                    log.emit(
                        Level::Debug,
                        &[("attempts", Value::from(attempt))],
                        format_args!("Opened conf map after retrying"),
                    );
                }
                return Ok(handle);
            }
            Err(err) if attempt < policy.attempts() => {
                let err = err.to_string();
                log.emit(
                    Level::Debug,
                    &[
                        ("attempt", Value::from(attempt)),
                        ("error", Value::from(err.as_str())),
                    ],
                    format_args!("Conf map not available yet, retrying in {:?}", policy.backoff()),
                );
                pause(policy.backoff());
                attempt += 1;
            }
            Err(source) => {
                log.warn_error(&source, "Failed to open conf map");
                log.warn_degraded("Opening conf map failed");
                return Err(SyncError::MapUnavailable {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}
