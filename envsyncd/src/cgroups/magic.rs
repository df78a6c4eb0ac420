use std::path::Path;

use nix::sys::statfs::statfs;

use super::{CgroupFsMagic, DetectError};

const TMPFS_MAGIC: u64 = 0x0102_1994;

/// Classify the cgroup mount from its filesystem magic.
///
/// A tmpfs root is the v1 layout (or hybrid, where the tracking controllers
/// still live on v1): it only counts as legacy once one of the controller
/// mounts below it reports the cgroupfs magic.
pub fn classify_magic(root_magic: u64, controller_magics: &[u64]) -> Option<CgroupFsMagic> {
    match root_magic {
        CgroupFsMagic::CGROUP2_SUPER_MAGIC => Some(CgroupFsMagic::Unified),
        CgroupFsMagic::CGROUP_SUPER_MAGIC => Some(CgroupFsMagic::Legacy),
        TMPFS_MAGIC => controller_magics
            .iter()
            .any(|m| *m == CgroupFsMagic::CGROUP_SUPER_MAGIC)
            .then_some(CgroupFsMagic::Legacy),
        _ => None,
    }
}

pub(super) fn detect(root: &Path, controllers: &[String]) -> Result<CgroupFsMagic, DetectError> {
    detect_with(root, controllers, fs_magic)
}

fn detect_with<F>(
    root: &Path,
    controllers: &[String],
    stat: F,
) -> Result<CgroupFsMagic, DetectError>
where
    F: Fn(&Path) -> Result<u64, DetectError>,
{
    let root_magic = stat(root)?;

    let mut controller_magics = Vec::new();
    if root_magic == TMPFS_MAGIC {
        // an unreadable controller mount is skipped, a later one may still classify
        controller_magics = controllers
            .iter()
            .map(|name| root.join(name))
            .filter(|dir| dir.is_dir())
            .filter_map(|dir| stat(&dir).ok())
            .collect();
    }

    classify_magic(root_magic, &controller_magics).ok_or_else(|| DetectError::UnknownMagic {
        path: root.to_path_buf(),
        magic: root_magic,
    })
}

fn fs_magic(path: &Path) -> Result<u64, DetectError> {
    let stat = statfs(path).map_err(|source| DetectError::Statfs {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(stat.filesystem_type().0 as u64)
}
