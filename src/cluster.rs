// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use crate::config::*;
use crate::flags::{DrbdRscFlags, ResourceFlags};
use crate::layer::*;
use crate::props::Props;
use crate::state::State;

pub const META_CHILD_SUFFIX: &str = ".meta";

/// Cluster is the model used to represent the resources of the local node in memory.
///
/// Unlike the persistent model, which views a resource as a definition placed on several nodes,
/// the in-memory model views the local node as a list of layer stacks: one DRBD resource per
/// placement on this node, with its peers and the storage layers beneath it.
///
/// The layer data carries runtime state between device manager passes, so a Cluster is built
/// once and then reused for every pass.
#[derive(Debug)]
pub struct Cluster {
    local_node: String,
    settings: Settings,
    resources: Vec<LayerData>,
    store: Arc<State>,
}

impl Cluster {
    /// Create a new Cluster from the config file at `path`, or the default config path.
    pub fn new(path: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let default_path = crate::default_config_path();
        let path = path.unwrap_or(&default_path);
        let config = Config::from_file(path).inspect_err(|e| {
            eprintln!("{e}");
        })?;
        let store = Arc::new(State::new(&config.settings.statefile)?);
        Ok(Self::from_config(&config, store))
    }

    pub fn from_config(conf: &Config, store: Arc<State>) -> Self {
        let mut cluster = Cluster {
            local_node: conf.local_node.clone(),
            settings: conf.settings.clone(),
            resources: Vec::new(),
            store,
        };

        for rsc_def in &conf.resources {
            if let Some(rsc) = cluster.build_resource(conf, rsc_def) {
                cluster.resources.push(LayerData::Drbd(Box::new(rsc)));
            }
        }
        cluster
    }

    fn build_resource(&self, conf: &Config, rsc_def: &ResourceDefinition) -> Option<DrbdResource> {
        let placement = rsc_def
            .placements
            .iter()
            .find(|p| p.node == self.local_node)?;
        let address = conf.node(&self.local_node)?.address;

        let definition = Arc::new(ResourceDefinitionLayer {
            name: rsc_def.name.clone(),
            peer_slots: rsc_def.peer_slots,
            al_stripes: rsc_def.al_stripes,
            al_stripe_size_kib: rsc_def.al_stripe_size_kib,
            transport: rsc_def.transport.clone(),
            protocol: rsc_def.protocol.clone(),
            tcp_port: rsc_def.tcp_port,
            secret: rsc_def.secret.clone(),
            down: rsc_def.down,
            force_initial_sync: rsc_def.force_initial_sync,
            volumes: rsc_def
                .volumes
                .iter()
                .map(|v| {
                    (
                        v.number,
                        crate::layer::VolumeDefinition {
                            vlm_nr: v.number,
                            minor: v.minor,
                            size_kib: v.size_kib,
                            current_gi: v.current_gi.clone(),
                            fs_type: v.fs_type.clone(),
                        },
                    )
                })
                .collect(),
            props: Props::new(
                Arc::clone(&self.store),
                &format!("resource-definitions/{}", rsc_def.name),
            ),
        });

        let flags: ResourceFlags = placement.flags.iter().copied().collect();
        let drbd_flags = placement
            .drbd_flags
            .iter()
            .fold(DrbdRscFlags::empty(), |acc, f| acc | *f);

        let volumes = rsc_def
            .volumes
            .iter()
            .map(|def| {
                let mut vlm = DrbdVolume::new(def.number, def.minor, def.size_kib);
                if let Some(placed) = placement.volumes.iter().find(|p| p.number == def.number) {
                    vlm.flags = placed.flags.iter().copied().collect();
                    vlm.thin = placed.thin;
                }
                (def.number, vlm)
            })
            .collect();

        let suffixed_name = format!("{}{}", rsc_def.name, placement.suffix);
        let diskless = flags.is_diskless();
        let data_child = (!diskless).then(|| {
            Box::new(LayerData::Storage(storage_child(
                &suffixed_name,
                placement,
                |v| v.backing_disk.clone(),
            )))
        });
        let meta_child = (!diskless && placement.volumes.iter().any(|v| v.meta_disk.is_some()))
            .then(|| {
                Box::new(LayerData::Storage(storage_child(
                    &format!("{suffixed_name}{META_CHILD_SUFFIX}"),
                    placement,
                    |v| v.meta_disk.clone(),
                )))
            });

        let peers = rsc_def
            .placements
            .iter()
            .filter(|p| p.node != self.local_node)
            .filter_map(|p| {
                let node = conf.node(&p.node)?;
                Some(PeerResource {
                    node_name: p.node.clone(),
                    node_id: NodeId(p.node_id),
                    address: node.address,
                    flags: p.flags.iter().copied().collect(),
                    volumes: rsc_def
                        .volumes
                        .iter()
                        .map(|def| {
                            let flags = p
                                .volumes
                                .iter()
                                .find(|v| v.number == def.number)
                                .map(|v| v.flags.iter().copied().collect())
                                .unwrap_or_default();
                            (def.number, PeerVolume { flags })
                        })
                        .collect(),
                })
            })
            .collect();

        Some(DrbdResource {
            node_name: self.local_node.clone(),
            node_id: NodeId(placement.node_id),
            address,
            rsc_name: rsc_def.name.clone(),
            suffix: placement.suffix.clone(),
            flags,
            drbd_flags,
            peer_slots: rsc_def.peer_slots,
            props: Props::new(
                Arc::clone(&self.store),
                &format!("resources/{suffixed_name}"),
            ),
            definition,
            volumes,
            peers,
            skip_disk: self.settings.skip_disk || placement.skip_disk,
            create_primary: placement.create_primary,
            suspend_io: placement.suspend_io,
            rollback_target: placement.rollback_target.clone(),
            data_child,
            meta_child,
            exists: false,
            adjust_required: false,
            primary: false,
            suspended: false,
            res_file_exists: false,
            promotion_score: None,
            may_promote: None,
        })
    }

    /// Print what this node manages. `verbose` adds the volumes and peers of each resource.
    pub fn print_summary(&self, verbose: bool) {
        println!(
            "Node '{}' manages {} DRBD resources; resource files in {}",
            self.local_node,
            self.drbd_resources().count(),
            self.settings.conf_dir
        );
        for rsc in self.drbd_resources() {
            let kind = if rsc.is_diskless() { "diskless" } else { "diskful" };
            println!(
                "    {} (node id {}, port {}, {kind}): {} volumes, {} peers",
                rsc.suffixed_name(),
                rsc.node_id,
                rsc.definition.tcp_port,
                rsc.volumes.len(),
                rsc.peers.len()
            );
            if !verbose {
                continue;
            }
            for vlm in rsc.volumes.values() {
                let disk = rsc
                    .data_child
                    .as_deref()
                    .and_then(|c| c.as_child())
                    .and_then(|c| c.volumes.get(&vlm.vlm_nr))
                    .and_then(|v| v.backing_disk.as_deref())
                    .unwrap_or("none");
                println!(
                    "        volume {}: minor {}, {} KiB on {disk}{}",
                    vlm.vlm_nr,
                    vlm.minor,
                    vlm.usable_size_kib,
                    if vlm.thin { " (thin)" } else { "" }
                );
            }
            for peer in &rsc.peers {
                println!(
                    "        peer {} (node id {}) at {}",
                    peer.node_name, peer.node_id, peer.address
                );
            }
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<State> {
        &self.store
    }

    pub fn resources_mut(&mut self) -> &mut [LayerData] {
        &mut self.resources
    }

    /// The DRBD resources of the local node.
    pub fn drbd_resources(&self) -> impl Iterator<Item = &DrbdResource> {
        self.resources.iter().filter_map(|r| match r {
            LayerData::Drbd(rsc) => Some(rsc.as_ref()),
            _ => None,
        })
    }

    pub fn drbd_resource(&self, name: &str) -> Option<&DrbdResource> {
        self.drbd_resources()
            .find(|r| r.suffixed_name().eq_ignore_ascii_case(name))
    }

    pub fn drbd_resource_mut(&mut self, name: &str) -> Option<&mut DrbdResource> {
        self.resources.iter_mut().find_map(|r| match r {
            LayerData::Drbd(rsc) if rsc.suffixed_name().eq_ignore_ascii_case(name) => {
                Some(rsc.as_mut())
            }
            _ => None,
        })
    }
}

fn storage_child(
    suffixed_name: &str,
    placement: &Placement,
    disk: impl Fn(&PlacedVolume) -> Option<String>,
) -> ChildLayer {
    ChildLayer {
        suffixed_name: suffixed_name.to_string(),
        volumes: placement
            .volumes
            .iter()
            .map(|v| {
                (
                    v.number,
                    ChildVolume {
                        device_path: None,
                        backing_disk: disk(v),
                        thin: v.thin,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
}
