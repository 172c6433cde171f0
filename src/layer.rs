// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! layer.rs
//!
//! The layer data the device manager works on: one DRBD resource per (node, resource) with its
//! volumes and peers, plus the child layers stacked beneath it.

use std::{collections::BTreeMap, fmt, net::IpAddr, sync::Arc};

use crate::{
    error::Result,
    flags::{DrbdRscFlags, ResourceFlags, VolumeFlags},
    props::{Props, KEY_BACKUP_NODE_IDS_TO_RESET, PROP_PRIMARY_SET},
    report::Report,
};

pub const DRBD_DEVICE_PATH_PREFIX: &str = "/dev/drbd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeState {
    #[default]
    AsExpected,
    /// The device is smaller than requested and has to grow.
    TooSmall,
    /// The device is larger than requested and has to shrink.
    TooLarge,
}

#[derive(Debug, Clone)]
pub struct VolumeDefinition {
    pub vlm_nr: u32,
    pub minor: u32,
    pub size_kib: u64,
    /// Expected current generation identifier for volumes that skip the initial sync.
    pub current_gi: Option<String>,
    /// Filesystem to create once the initial sync has been started.
    pub fs_type: Option<String>,
}

/// Settings shared by every node that has this resource deployed.
#[derive(Debug)]
pub struct ResourceDefinitionLayer {
    pub name: String,
    pub peer_slots: u16,
    pub al_stripes: u32,
    pub al_stripe_size_kib: u64,
    pub transport: String,
    pub protocol: String,
    pub tcp_port: u16,
    pub secret: Option<String>,
    pub down: bool,
    pub force_initial_sync: bool,
    pub volumes: BTreeMap<u32, VolumeDefinition>,
    pub props: Props,
}

impl ResourceDefinitionLayer {
    pub fn primary_set_on(&self) -> Option<String> {
        self.props.get(PROP_PRIMARY_SET)
    }

    pub fn backup_node_ids_to_reset(&self) -> Option<String> {
        self.props.get(KEY_BACKUP_NODE_IDS_TO_RESET)
    }

    pub fn volume(&self, vlm_nr: u32) -> Option<&VolumeDefinition> {
        self.volumes.get(&vlm_nr)
    }
}

#[derive(Debug, Clone)]
pub struct DrbdVolume {
    pub vlm_nr: u32,
    pub minor: u32,
    pub flags: VolumeFlags,
    pub usable_size_kib: u64,
    /// Device provided by the data child layer.
    pub data_device: Option<String>,
    /// Device provided by the meta child layer. `None` means internal metadata.
    pub meta_disk_path: Option<String>,
    pub thin: bool,
    pub size_state: SizeState,

    pub exists: bool,
    pub has_disk: bool,
    pub has_metadata: bool,
    pub failed: bool,
    pub metadata_is_new: bool,
    pub check_metadata: bool,
    pub device_path: Option<String>,
}

impl DrbdVolume {
    pub fn new(vlm_nr: u32, minor: u32, usable_size_kib: u64) -> Self {
        Self {
            vlm_nr,
            minor,
            flags: VolumeFlags::empty(),
            usable_size_kib,
            data_device: None,
            meta_disk_path: None,
            thin: false,
            size_state: SizeState::AsExpected,
            exists: false,
            has_disk: false,
            has_metadata: false,
            failed: false,
            metadata_is_new: false,
            check_metadata: true,
            device_path: None,
        }
    }

    pub fn has_external_md(&self) -> bool {
        self.meta_disk_path.is_some()
    }

    /// The device holding the metadata: the meta disk, or the data device for internal metadata.
    pub fn md_device(&self) -> Option<&str> {
        self.meta_disk_path
            .as_deref()
            .or(self.data_device.as_deref())
    }

    pub fn generated_device_path(&self) -> String {
        format!("{DRBD_DEVICE_PATH_PREFIX}{}", self.minor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerVolume {
    pub flags: VolumeFlags,
}

/// The same resource as deployed on another node.
#[derive(Debug, Clone)]
pub struct PeerResource {
    pub node_name: String,
    pub node_id: NodeId,
    pub address: IpAddr,
    pub flags: ResourceFlags,
    pub volumes: BTreeMap<u32, PeerVolume>,
}

impl PeerResource {
    pub fn is_diskless(&self) -> bool {
        self.flags.is_diskless()
    }

    /// Whether the peer's DRBD device is supposed to exist at all.
    pub fn is_expected(&self) -> bool {
        !self.flags.is_marked_for_removal()
    }
}

/// The DRBD layer of one resource on the local node.
#[derive(Debug)]
pub struct DrbdResource {
    pub node_name: String,
    pub node_id: NodeId,
    pub address: IpAddr,
    pub rsc_name: String,
    pub suffix: String,
    pub flags: ResourceFlags,
    pub drbd_flags: DrbdRscFlags,
    pub peer_slots: u16,
    pub definition: Arc<ResourceDefinitionLayer>,
    pub volumes: BTreeMap<u32, DrbdVolume>,
    pub peers: Vec<PeerResource>,
    pub props: Props,
    /// Degraded mode: the disk is not touched, DRBD runs with `--skip-disk`.
    pub skip_disk: bool,
    /// Set upstream for a new resource that should drive the initial sync.
    pub create_primary: bool,
    /// I/O on the device should be frozen, e.g. while a snapshot is taken.
    pub suspend_io: bool,
    /// Snapshot to roll back to.
    pub rollback_target: Option<String>,
    pub data_child: Option<Box<LayerData>>,
    pub meta_child: Option<Box<LayerData>>,

    pub exists: bool,
    pub adjust_required: bool,
    pub primary: bool,
    pub suspended: bool,
    pub res_file_exists: bool,
    pub promotion_score: Option<i32>,
    pub may_promote: Option<bool>,
}

impl DrbdResource {
    pub fn suffixed_name(&self) -> String {
        format!("{}{}", self.rsc_name, self.suffix)
    }

    pub fn is_diskless(&self) -> bool {
        self.flags.is_diskless()
    }

    /// Every local model entity stops existing.
    pub fn mark_nonexistent(&mut self) {
        self.exists = false;
        for vlm in self.volumes.values_mut() {
            vlm.exists = false;
        }
    }

    /// Peers whose DRBD device is expected to exist and that are not deactivated.
    pub fn active_peers(&self) -> impl Iterator<Item = &PeerResource> {
        self.peers
            .iter()
            .filter(|p| p.is_expected() && !p.flags.is_inactive())
    }

    /// All node ids of this resource's deployments, including the local one.
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        std::iter::once(self.node_id)
            .chain(self.peers.iter().map(|p| p.node_id))
            .collect()
    }

    /// The configuration file can only be rendered once the child layers provide devices.
    pub fn is_res_file_ready(&self) -> bool {
        self.is_diskless()
            || self
                .volumes
                .values()
                .filter(|v| !v.flags.is_marked_for_removal())
                .all(|v| v.data_device.is_some())
    }

    /// Copy the devices provided by the child layers into the DRBD volumes.
    pub fn refresh_backing_devices(&mut self) {
        for vlm in self.volumes.values_mut() {
            if let Some(data) = self.data_child.as_deref().and_then(|c| c.volume(vlm.vlm_nr)) {
                vlm.data_device = data.device_path.clone();
                vlm.thin = data.thin;
            }
            vlm.meta_disk_path = self
                .meta_child
                .as_deref()
                .and_then(|c| c.volume(vlm.vlm_nr))
                .and_then(|m| m.device_path.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Drbd,
    Storage,
    Cache,
    Writecache,
    Luks,
    Bcache,
}

#[derive(Debug, Clone, Default)]
pub struct ChildVolume {
    /// Device node this layer provides to the layer above, once it is ready.
    pub device_path: Option<String>,
    /// Device this layer consumes.
    pub backing_disk: Option<String>,
    pub thin: bool,
}

#[derive(Debug, Clone)]
pub struct ChildLayer {
    pub suffixed_name: String,
    pub volumes: BTreeMap<u32, ChildVolume>,
}

/// Layer data of any kind. The DRBD reconciler only handles its own variant and passes the
/// others to a [`ChildProcessor`].
#[derive(Debug)]
pub enum LayerData {
    Drbd(Box<DrbdResource>),
    Storage(ChildLayer),
    Cache(ChildLayer),
    Writecache(ChildLayer),
    Luks(ChildLayer),
    Bcache(ChildLayer),
}

impl LayerData {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerData::Drbd(_) => LayerKind::Drbd,
            LayerData::Storage(_) => LayerKind::Storage,
            LayerData::Cache(_) => LayerKind::Cache,
            LayerData::Writecache(_) => LayerKind::Writecache,
            LayerData::Luks(_) => LayerKind::Luks,
            LayerData::Bcache(_) => LayerKind::Bcache,
        }
    }

    pub fn suffixed_name(&self) -> String {
        match self {
            LayerData::Drbd(rsc) => rsc.suffixed_name(),
            LayerData::Storage(c)
            | LayerData::Cache(c)
            | LayerData::Writecache(c)
            | LayerData::Luks(c)
            | LayerData::Bcache(c) => c.suffixed_name.clone(),
        }
    }

    pub fn as_child(&self) -> Option<&ChildLayer> {
        match self {
            LayerData::Drbd(_) => None,
            LayerData::Storage(c)
            | LayerData::Cache(c)
            | LayerData::Writecache(c)
            | LayerData::Luks(c)
            | LayerData::Bcache(c) => Some(c),
        }
    }

    pub fn as_child_mut(&mut self) -> Option<&mut ChildLayer> {
        match self {
            LayerData::Drbd(_) => None,
            LayerData::Storage(c)
            | LayerData::Cache(c)
            | LayerData::Writecache(c)
            | LayerData::Luks(c)
            | LayerData::Bcache(c) => Some(c),
        }
    }

    fn volume(&self, vlm_nr: u32) -> Option<&ChildVolume> {
        self.as_child().and_then(|c| c.volumes.get(&vlm_nr))
    }
}

/// Processes a layer beneath DRBD.
pub trait ChildProcessor {
    fn process_child(&mut self, child: &mut LayerData, report: &mut Report) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(path: Option<&str>, thin: bool) -> Box<LayerData> {
        Box::new(LayerData::Storage(ChildLayer {
            suffixed_name: "r0".to_string(),
            volumes: BTreeMap::from([(
                0,
                ChildVolume {
                    device_path: path.map(str::to_string),
                    backing_disk: None,
                    thin,
                },
            )]),
        }))
    }

    #[test]
    fn md_device_prefers_meta_disk() {
        let mut vlm = DrbdVolume::new(0, 1000, 1024);
        vlm.data_device = Some("/dev/vg/r0_00000".to_string());
        assert_eq!(vlm.md_device(), Some("/dev/vg/r0_00000"));
        assert!(!vlm.has_external_md());
        vlm.meta_disk_path = Some("/dev/vg/r0.meta_00000".to_string());
        assert_eq!(vlm.md_device(), Some("/dev/vg/r0.meta_00000"));
        assert_eq!(vlm.generated_device_path(), "/dev/drbd1000");
    }

    #[test]
    fn child_layer_lookup() {
        let data = child(Some("/dev/vg/r0_00000"), true);
        assert_eq!(data.kind(), LayerKind::Storage);
        assert_eq!(data.suffixed_name(), "r0");
        let vlm = data.volume(0).unwrap();
        assert!(vlm.thin);
        assert_eq!(vlm.device_path.as_deref(), Some("/dev/vg/r0_00000"));
        assert!(data.volume(1).is_none());
    }
}
