use super::{CgroupFsMagic, DetectError, SubsysInfo};

const PROC_CGROUPS: &str = "/proc/cgroups";

/// One row of `/proc/cgroups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupSubsys {
    pub name: String,
    /// Position in the kernel's subsystem table.
    pub index: u32,
    pub hierarchy: u32,
    pub enabled: bool,
}

/// Parse `/proc/cgroups`. The kernel prints every compiled-in controller in
/// subsystem-id order, so the row position is the css index the probes use.
pub fn parse_proc_cgroups(contents: &str) -> Result<Vec<CgroupSubsys>, DetectError> {
    let mut table = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, hierarchy, num_cgroups, enabled] = fields[..] else {
            return Err(malformed(line));
        };

        let index = u32::try_from(table.len()).map_err(|_| malformed(line))?;
        // the cgroup count is only validated
        parse_field(num_cgroups, line)?;
        table.push(CgroupSubsys {
            name: name.to_string(),
            index,
            hierarchy: parse_field(hierarchy, line)?,
            enabled: parse_field(enabled, line)? != 0,
        });
    }

    if table.is_empty() {
        return Err(DetectError::Parse {
            what: PROC_CGROUPS,
            detail: "no controllers listed".to_string(),
        });
    }

    Ok(table)
}

/// Pick the first enabled controller from `preferred` that is usable under
/// `magic`: on v1 it must sit on a mounted hierarchy, on v2 it must not have
/// been claimed by a v1 hierarchy.
pub fn select_tracked(
    table: &[CgroupSubsys],
    preferred: &[String],
    magic: CgroupFsMagic,
) -> Result<SubsysInfo, DetectError> {
    preferred
        .iter()
        .filter_map(|want| table.iter().find(|s| s.name == *want))
        .find(|s| {
            s.enabled
                && match magic {
                    CgroupFsMagic::Legacy => s.hierarchy != 0,
                    CgroupFsMagic::Unified => s.hierarchy == 0,
                }
        })
        .map(|s| SubsysInfo {
            controller: s.name.clone(),
            hierarchy_id: s.hierarchy,
            subsys_idx: s.index,
        })
        .ok_or_else(|| DetectError::NoTrackedController(preferred.to_vec()))
}

fn parse_field(raw: &str, line: &str) -> Result<u32, DetectError> {
    raw.parse().map_err(|_| malformed(line))
}

fn malformed(line: &str) -> DetectError {
    DetectError::Parse {
        what: PROC_CGROUPS,
        detail: line.to_string(),
    }
}
