// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod controller;
pub mod devmgr;
pub mod drbd;
pub mod error;
pub mod exec;
pub mod flags;
pub mod layer;
pub mod manager;
pub mod props;
pub mod report;
pub mod state;
pub mod test_env;

pub fn default_config_path() -> String {
    match std::env::var("REPLICAD_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/replicad/replicad.toml".to_string(),
    }
}

pub fn default_statefile_path() -> String {
    match std::env::var("REPLICAD_STATEFILE") {
        Ok(statefile) => statefile,
        Err(_) => "/var/lib/replicad/replicad.state".to_string(),
    }
}

/// Directory holding the generated DRBD resource files. drbdadm picks these up through an
/// `include` in the global DRBD configuration.
pub fn default_res_dir() -> String {
    match std::env::var("REPLICAD_RES_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/lib/linstor.d".to_string(),
    }
}

pub fn default_backup_dir() -> String {
    match std::env::var("REPLICAD_BACKUP_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/lib/linstor.d/backup".to_string(),
    }
}

/// Unix socket on which the controller accepts one-way notifications. `None` means that
/// notifications are only logged.
pub fn default_controller_socket() -> Option<String> {
    std::env::var("REPLICAD_CONTROLLER_SOCKET").ok()
}
