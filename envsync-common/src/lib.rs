#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

use core::mem::{align_of, offset_of, size_of};

use bytemuck::{Pod, Zeroable};

// =============================================================================
// RUNTIME CONFIGURATION MAP - Shared Layout Definitions
// =============================================================================
//
// User space writes exactly one entry into a pinned BPF array map; compiled
// probes look it up at event time to learn which cgroup hierarchy and which
// controller slot to follow.
//
// MEMORY LAYOUT (layout version 1, 8 bytes, 4-byte aligned):
//   key:   [0..4] key: u32              - always CONF_MAP_KEY
//   value: [0..4] cgrp_hierarchy: u32   - tracking cgroup hierarchy ID
//          [4..8] cgrp_subsys_idx: u32  - tracked controller's css index
//
// The kernel side declares the same fields in the same order. Any change here
// must bump CONF_LAYOUT_VERSION and be mirrored in the probe sources.
// =============================================================================

/// Name under which the loader pins the configuration map.
pub const CONF_MAP_NAME: &str = "tg_conf_map";

/// The only key ever written.
pub const CONF_MAP_KEY: u32 = 0;

/// Bumped whenever `ConfKey` or `ConfValue` change shape.
pub const CONF_LAYOUT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfKey {
    pub key: u32,
}

impl ConfKey {
    /// The singleton key.
    pub const LIVE: Self = Self { key: CONF_MAP_KEY };

    /// Borrow the key as the bytes handed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl Default for ConfKey {
    fn default() -> Self {
        Self::LIVE
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfValue {
    /// Cgroup hierarchy ID used for tracking (0 on the unified hierarchy).
    pub cgrp_hierarchy: u32,
    /// Index of the tracked controller in the kernel's subsystem table.
    pub cgrp_subsys_idx: u32,
}

impl ConfValue {
    pub const fn new(cgrp_hierarchy: u32, cgrp_subsys_idx: u32) -> Self {
        Self {
            cgrp_hierarchy,
            cgrp_subsys_idx,
        }
    }

    pub const fn zeroed() -> Self {
        Self::new(0, 0)
    }

    /// Borrow the value as the bytes handed to the kernel. The view lives only
    /// as long as the borrow of `self`.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read a value back from a byte view. Returns `None` when `bytes` is not
    /// exactly the size of the record.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

impl Default for ConfValue {
    fn default() -> Self {
        Self::zeroed()
    }
}

// The kernel struct is two packed __u32 fields; fail the build otherwise.
const _: () = {
    assert!(size_of::<ConfKey>() == 4);
    assert!(size_of::<ConfValue>() == 8);
    assert!(align_of::<ConfValue>() == 4);
    assert!(offset_of!(ConfValue, cgrp_hierarchy) == 0);
    assert!(offset_of!(ConfValue, cgrp_subsys_idx) == 4);
};

#[cfg(feature = "user")]
#[allow(dead_code)]
fn assert_conf_traits() {
    fn assert_traits<T: Pod + Zeroable>() {}
    assert_traits::<ConfKey>();
    assert_traits::<ConfValue>();
}
