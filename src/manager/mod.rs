// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{sync::Arc, time::Duration};

use {
    clap::Parser,
    futures::future::{self, Either},
    log::{debug, error, info, warn},
};

use crate::{
    cluster::Cluster,
    commands::{handled_error, Handle, HandledResult},
    controller::{ControllerLink, LogLink, SocketLink},
    devmgr::{DeviceManager, StorageHandler},
    drbd::{
        adm::DrbdUtils,
        conf_file::ResFiles,
        events,
        layer::LayerSettings,
        tracker::StateTracker,
        DrbdLayer,
    },
};

#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long)]
    pub config: Option<String>,

    /// Run even when not started as root. The DRBD utilities will most likely fail.
    #[arg(long, hide = true)]
    pub no_root_check: bool,
}

/// Build the production DRBD layer for the settings of `cluster`.
pub fn drbd_layer(cluster: &Cluster, tracker: Arc<StateTracker>) -> HandledResult<DrbdLayer> {
    let settings = cluster.settings();
    let files = ResFiles::new(&settings.conf_dir, &settings.backup_dir);
    files.ensure_dirs().handle_err(|e| {
        eprintln!(
            "Could not create the resource file directories '{}' and '{}': {e}",
            settings.conf_dir, settings.backup_dir
        )
    })?;

    let link: Arc<dyn ControllerLink> = match &settings.controller_socket {
        Some(path) => Arc::new(SocketLink::new(path)),
        None => Arc::new(LogLink),
    };
    let utils = DrbdUtils::new();
    let layer_settings = LayerSettings {
        use_adjustable_list: settings.use_adjustable_list,
        primary_timeout: Duration::from_millis(settings.primary_timeout_ms),
        windows: utils.windows,
    };
    Ok(DrbdLayer::new(
        Arc::new(utils),
        tracker,
        link,
        files,
        layer_settings,
    ))
}

pub fn check_root() -> HandledResult<()> {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("replicad has to run as root to manage DRBD devices");
        return handled_error();
    }
    Ok(())
}

/// Run passes until an implementation error shows up. The layer data is moved onto a blocking
/// worker for each pass, since the DRBD utilities are called synchronously.
async fn pass_loop(
    mut cluster: Cluster,
    mut manager: DeviceManager<StorageHandler>,
    tracker: Arc<StateTracker>,
) -> HandledResult<()> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(cluster.settings().pass_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !tracker.has_initial_state() {
            debug!("waiting for the initial DRBD state");
            continue;
        }

        let joined = tokio::task::spawn_blocking(move || {
            let result = manager.run_pass(cluster.resources_mut());
            (cluster, manager, result)
        })
        .await;
        let (c, m, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                error!("device manager pass panicked: {e}");
                return handled_error();
            }
        };
        cluster = c;
        manager = m;

        match result {
            Ok(report) => {
                for entry in report.entries() {
                    debug!("{}: {entry}", entry.rsc_name);
                }
                if report.has_errors() {
                    warn!("device manager pass finished with errors");
                }
            }
            Err(e) => {
                error!("stopping after an internal error: {e}");
                return handled_error();
            }
        }
    }
}

/// The replicad daemon.
///
/// This launches two tasks:
///
/// - A monitor that keeps a `drbdsetup events2` process running and feeds the DRBD state into
///   the state tracker.
///
/// - The pass loop, which periodically reconciles the DRBD resources of this node.
pub fn main(cluster: Cluster, args: &Cli) -> HandledResult<()> {
    if !args.no_root_check {
        check_root()?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch manager runtime: {e}"))?;

    let tracker = Arc::new(StateTracker::new());
    let layer = drbd_layer(&cluster, Arc::clone(&tracker))?;
    let manager = DeviceManager::new(layer, StorageHandler);
    let events_command = cluster.settings().events_command.clone();

    info!(
        "managing {} DRBD resources on node '{}'",
        cluster.drbd_resources().count(),
        cluster.local_node()
    );

    rt.block_on(async {
        let monitor = events::monitor(Arc::clone(&tracker), events_command);
        let passes = pass_loop(cluster, manager, tracker);
        futures::pin_mut!(monitor, passes);
        match future::select(monitor, passes).await {
            Either::Left(((), _)) => {
                error!("DRBD events monitor stopped");
                handled_error()
            }
            Either::Right((result, _)) => result,
        }
    })
}
