// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use clap::Args;

use crate::{
    commands::{handled_error, load_cluster, Cli, Handle, HandledResult},
    devmgr::{DeviceManager, StorageHandler},
    drbd::{events, tracker::StateTracker},
    manager,
    report::EntryKind,
};

#[derive(Args, Debug, Clone)]
pub struct OnceArgs {
    /// Run even when not started as root.
    #[arg(long, hide = true)]
    no_root_check: bool,
}

/// Take a snapshot of the DRBD state and run exactly one device manager pass.
pub fn once(cli: &Cli, args: &OnceArgs) -> HandledResult<()> {
    if !args.no_root_check {
        manager::check_root()?;
    }
    let mut cluster = load_cluster(cli)?;

    let tracker = Arc::new(StateTracker::new());
    events::snapshot_now(Arc::clone(&tracker), &cluster.settings().events_command)
        .handle_err(|e| eprintln!("Could not read the current DRBD state: {e}"))?;

    let layer = manager::drbd_layer(&cluster, tracker)?;
    let mut manager = DeviceManager::new(layer, StorageHandler);
    let report = manager
        .run_pass(cluster.resources_mut())
        .handle_err(|e| eprintln!("Device manager pass aborted: {e}"))?;

    for entry in report.entries() {
        let kind = match entry.kind {
            EntryKind::Deleted => "DELETED",
            EntryKind::Modified => "MODIFIED",
            EntryKind::Info => "INFO",
            EntryKind::Error => "ERROR",
        };
        println!("{kind}: {entry}");
    }

    if report.has_errors() {
        return handled_error();
    }
    Ok(())
}
