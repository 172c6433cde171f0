// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! flags.rs
//!
//! Desired-state flags of resources and volumes. They are set upstream and only read by the
//! reconciler, with the exception of the DRBD resource flags which belong to this layer.

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceFlag {
    Delete = 1 << 0,
    DrbdDelete = 1 << 1,
    Inactive = 1 << 2,
    DiskRemoving = 1 << 3,
    RestoreFromSnapshot = 1 << 4,
    DrbdDiskless = 1 << 5,
}

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeFlag {
    Delete = 1 << 0,
    DrbdDelete = 1 << 1,
    Cloning = 1 << 2,
    Resize = 1 << 3,
    DrbdResize = 1 << 4,
}

/// Flags owned by the DRBD layer of a single resource.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrbdRscFlag {
    /// The resource has completed at least one successful adjust.
    Initialized = 1 << 0,
    /// Create new metadata even if a signature is found, as long as the device is not up.
    ForceNewMetadata = 1 << 1,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceFlags(BitFlags<ResourceFlag>);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeFlags(BitFlags<VolumeFlag>);

pub type DrbdRscFlags = BitFlags<DrbdRscFlag>;

impl ResourceFlags {
    pub fn empty() -> Self {
        Self(BitFlags::empty())
    }

    pub fn contains(&self, flag: ResourceFlag) -> bool {
        self.0.contains(flag)
    }

    pub fn insert(&mut self, flag: ResourceFlag) {
        self.0.insert(flag);
    }

    pub fn remove(&mut self, flag: ResourceFlag) {
        self.0.remove(flag);
    }

    /// DELETE or DRBD_DELETE.
    pub fn is_marked_for_removal(&self) -> bool {
        self.0.intersects(ResourceFlag::Delete | ResourceFlag::DrbdDelete)
    }

    /// Removal or deactivation: the device must not stay up.
    pub fn is_going_down(&self) -> bool {
        self.is_marked_for_removal() || self.0.contains(ResourceFlag::Inactive)
    }

    pub fn is_diskless(&self) -> bool {
        self.0.contains(ResourceFlag::DrbdDiskless)
    }

    pub fn is_disk_removing(&self) -> bool {
        self.0.contains(ResourceFlag::DiskRemoving)
    }

    pub fn is_inactive(&self) -> bool {
        self.0.contains(ResourceFlag::Inactive)
    }

    pub fn is_restore_from_snapshot(&self) -> bool {
        self.0.contains(ResourceFlag::RestoreFromSnapshot)
    }
}

impl VolumeFlags {
    pub fn empty() -> Self {
        Self(BitFlags::empty())
    }

    pub fn contains(&self, flag: VolumeFlag) -> bool {
        self.0.contains(flag)
    }

    pub fn insert(&mut self, flag: VolumeFlag) {
        self.0.insert(flag);
    }

    pub fn remove(&mut self, flag: VolumeFlag) {
        self.0.remove(flag);
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.0.intersects(VolumeFlag::Delete | VolumeFlag::DrbdDelete)
    }

    pub fn is_cloning(&self) -> bool {
        self.0.contains(VolumeFlag::Cloning)
    }

    /// Removed or being cloned: the volume has to be detached before anything else touches it.
    pub fn needs_detach(&self) -> bool {
        self.is_marked_for_removal() || self.is_cloning()
    }

    /// RESIZE and DRBD_RESIZE are either both set or both clear.
    pub fn resize_flags_consistent(&self) -> bool {
        self.0.contains(VolumeFlag::Resize) == self.0.contains(VolumeFlag::DrbdResize)
    }

    /// RESIZE and DRBD_RESIZE are both set: the volume is expected to change its size.
    pub fn is_resizing(&self) -> bool {
        self.0.contains(VolumeFlag::Resize | VolumeFlag::DrbdResize)
    }

    /// DRBD_RESIZE without RESIZE marks a peer that is still shrinking its DRBD device.
    pub fn is_peer_shrinking(&self) -> bool {
        self.0.contains(VolumeFlag::DrbdResize) && !self.0.contains(VolumeFlag::Resize)
    }
}

impl FromIterator<ResourceFlag> for ResourceFlags {
    fn from_iter<T: IntoIterator<Item = ResourceFlag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<VolumeFlag> for VolumeFlags {
    fn from_iter<T: IntoIterator<Item = VolumeFlag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<ResourceFlag> for ResourceFlags {
    fn from(flag: ResourceFlag) -> Self {
        Self(flag.into())
    }
}

impl From<VolumeFlag> for VolumeFlags {
    fn from(flag: VolumeFlag) -> Self {
        Self(flag.into())
    }
}
