// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeSet, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::flags::{DrbdRscFlag, ResourceFlag, VolumeFlag};

/// Config, along with its children, is the model for the resources deployed in the cluster as
/// written in the replicad configuration file. The config file is deserialized into a Config
/// object.
///
/// The model used in the config file is intentionally different from the layer data the device
/// manager works on. Since they are decoupled, the layer data can be changed without needing to
/// change the configuration file format.
#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    /// Name of the node this daemon runs on.
    pub local_node: String,
    #[serde(default)]
    pub settings: Settings,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not open config file \"{path}\": {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Check the references between nodes, resources, volumes and placements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node(&self.local_node).is_none() {
            return Err(invalid(format!(
                "local node '{}' is not in the node list",
                self.local_node
            )));
        }

        let mut minors = BTreeSet::new();
        let mut names = BTreeSet::new();
        for rsc in &self.resources {
            if !names.insert(rsc.name.to_lowercase()) {
                return Err(invalid(format!("resource '{}' is defined twice", rsc.name)));
            }
            for vlm in &rsc.volumes {
                if !minors.insert(vlm.minor) {
                    return Err(invalid(format!(
                        "minor {} of resource '{}' is already in use",
                        vlm.minor, rsc.name
                    )));
                }
            }

            let mut node_ids = BTreeSet::new();
            for placement in &rsc.placements {
                if self.node(&placement.node).is_none() {
                    return Err(invalid(format!(
                        "resource '{}' is placed on unknown node '{}'",
                        rsc.name, placement.node
                    )));
                }
                if !node_ids.insert(placement.node_id) {
                    return Err(invalid(format!(
                        "node id {} is used twice in resource '{}'",
                        placement.node_id, rsc.name
                    )));
                }
                for vlm in &placement.volumes {
                    if rsc.volume(vlm.number).is_none() {
                        return Err(invalid(format!(
                            "resource '{}' on '{}' has undefined volume {}",
                            rsc.name, placement.node, vlm.number
                        )));
                    }
                }
            }
            if rsc.placements.len() > usize::from(rsc.peer_slots) + 1 {
                return Err(invalid(format!(
                    "resource '{}' has more placements than peer slots",
                    rsc.name
                )));
            }
        }
        Ok(())
    }
}

fn default_conf_dir() -> String {
    crate::default_res_dir()
}

fn default_backup_dir() -> String {
    crate::default_backup_dir()
}

fn default_statefile() -> String {
    crate::default_statefile_path()
}

fn default_true() -> bool {
    true
}

fn default_events_command() -> Vec<String> {
    ["drbdsetup", "events2", "all"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_pass_interval() -> u64 {
    10
}

fn default_primary_timeout() -> u64 {
    2000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    #[serde(default = "default_conf_dir")]
    pub conf_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_statefile")]
    pub statefile: String,
    /// Run every resource of this node without touching its disks.
    #[serde(default)]
    pub skip_disk: bool,
    #[serde(default = "default_true")]
    pub use_adjustable_list: bool,
    #[serde(default = "default_events_command")]
    pub events_command: Vec<String>,
    #[serde(default = "default_pass_interval")]
    pub pass_interval_secs: u64,
    #[serde(default = "default_primary_timeout")]
    pub primary_timeout_ms: u64,
    pub controller_socket: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            conf_dir: default_conf_dir(),
            backup_dir: default_backup_dir(),
            statefile: default_statefile(),
            skip_disk: false,
            use_adjustable_list: true,
            events_command: default_events_command(),
            pass_interval_secs: default_pass_interval(),
            primary_timeout_ms: default_primary_timeout(),
            controller_socket: crate::default_controller_socket(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub name: String,
    pub address: IpAddr,
}

fn default_peer_slots() -> u16 {
    7
}

fn default_al_stripes() -> u32 {
    1
}

fn default_al_stripe_size() -> u64 {
    32
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_protocol() -> String {
    "C".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResourceDefinition {
    pub name: String,
    pub tcp_port: u16,
    #[serde(default = "default_peer_slots")]
    pub peer_slots: u16,
    #[serde(default = "default_al_stripes")]
    pub al_stripes: u32,
    #[serde(default = "default_al_stripe_size")]
    pub al_stripe_size_kib: u64,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub down: bool,
    #[serde(default)]
    pub force_initial_sync: bool,
    #[serde(default)]
    pub volumes: Vec<VolumeDefinition>,
    #[serde(default)]
    pub placements: Vec<Placement>,
}

impl ResourceDefinition {
    pub fn volume(&self, number: u32) -> Option<&VolumeDefinition> {
        self.volumes.iter().find(|v| v.number == number)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeDefinition {
    pub number: u32,
    pub minor: u32,
    pub size_kib: u64,
    pub current_gi: Option<String>,
    pub fs_type: Option<String>,
}

/// The resource as deployed on one node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Placement {
    pub node: String,
    pub node_id: u32,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub flags: Vec<ResourceFlag>,
    #[serde(default)]
    pub drbd_flags: Vec<DrbdRscFlag>,
    #[serde(default)]
    pub create_primary: bool,
    #[serde(default)]
    pub skip_disk: bool,
    #[serde(default)]
    pub suspend_io: bool,
    pub rollback_target: Option<String>,
    #[serde(default)]
    pub volumes: Vec<PlacedVolume>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlacedVolume {
    pub number: u32,
    pub backing_disk: Option<String>,
    pub meta_disk: Option<String>,
    #[serde(default)]
    pub thin: bool,
    #[serde(default)]
    pub flags: Vec<VolumeFlag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
local_node = "alpha"

[settings]
conf_dir = "/tmp/replicad/conf"
skip_disk = true

[[nodes]]
name = "alpha"
address = "10.0.0.1"

[[nodes]]
name = "beta"
address = "10.0.0.2"

[[resources]]
name = "r0"
tcp_port = 7000

[[resources.volumes]]
number = 0
minor = 1000
size_kib = 1048576
current_gi = "ABCDEF0123456789"

[[resources.placements]]
node = "alpha"
node_id = 0
drbd_flags = ["INITIALIZED"]

[[resources.placements.volumes]]
number = 0
backing_disk = "/dev/vg/r0_00000"
thin = true
flags = ["RESIZE", "DRBD_RESIZE"]

[[resources.placements]]
node = "beta"
node_id = 1
flags = ["DRBD_DISKLESS"]
"#;

    #[test]
    fn parses_with_defaults() {
        let config = Config::from_toml(CONFIG).unwrap();
        assert!(config.settings.skip_disk);
        assert_eq!(config.settings.conf_dir, "/tmp/replicad/conf");
        assert_eq!(config.settings.events_command, default_events_command());
        let rsc = &config.resources[0];
        assert_eq!(rsc.peer_slots, 7);
        assert_eq!(rsc.protocol, "C");
        assert_eq!((rsc.al_stripes, rsc.al_stripe_size_kib), (1, 32));
        assert!(!rsc.placements[0].suspend_io);
        assert_eq!(rsc.placements[1].flags, vec![ResourceFlag::DrbdDiskless]);
        assert_eq!(
            rsc.placements[0].volumes[0].flags,
            vec![VolumeFlag::Resize, VolumeFlag::DrbdResize]
        );
    }

    #[test]
    fn rejects_unknown_node() {
        let broken = CONFIG.replace("node = \"beta\"", "node = \"gamma\"");
        assert!(matches!(
            Config::from_toml(&broken),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_duplicate_node_id() {
        let broken = CONFIG.replace("node_id = 1", "node_id = 0");
        assert!(matches!(
            Config::from_toml(&broken),
            Err(ConfigError::Invalid(_))
        ));
    }
}
