// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! promote.rs
//!
//! Initial synchronization of new resources: either the controller picks a primary, or a node
//! created as primary briefly forces itself primary to start the sync and create filesystems.

use std::time::{Duration, Instant};

use log::{debug, info, trace};

use super::{
    adm::{DrbdAdm, PrimaryGuard},
    metadata,
    tracker::{Role, StateTracker},
};
use crate::{
    controller::{ControllerLink, Notification},
    error::{abort_msg, abort_vlm_msg, Error, Failure, Result},
    layer::DrbdResource,
    props::PROP_PRIMARY_SET,
};

pub const VALID_STATE_FOR_PRIMARY_TIMEOUT: Duration = Duration::from_millis(2000);

fn is_valid_for_primary(tracker: &StateTracker, rsc_name: &str) -> Result<bool> {
    match tracker.get_resource(rsc_name) {
        Ok(state) => Ok(state.is_some_and(|s| s.has_valid_state_for_primary())),
        Err(Error::NoInitialState) => Err(Error::storage(
            Failure::new(abort_msg(rsc_name)).cause("No initial DRBD state"),
        )),
        Err(e) => Err(e),
    }
}

/// Block until every volume of the resource has a disk state DRBD can be promoted with.
pub fn wait_for_valid_state_for_primary(
    tracker: &StateTracker,
    rsc_name: &str,
    timeout: Duration,
) -> Result<()> {
    // registered before the first check so no change can slip in between
    let observer = tracker.observe_disk(rsc_name);
    let deadline = Instant::now() + timeout;
    loop {
        if is_valid_for_primary(tracker, rsc_name)? {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || !observer.wait(remaining) {
            break;
        }
    }
    if is_valid_for_primary(tracker, rsc_name)? {
        return Ok(());
    }
    Err(Error::storage(
        Failure::new(abort_msg(rsc_name)).cause(format!(
            "Device did not get ready within {}ms",
            timeout.as_millis()
        )),
    ))
}

/// Decide on the initial sync once the resource was adjusted.
///
/// The first node seen or made primary is recorded on the resource definition. Once it is set,
/// this node neither asks for a primary nor forces itself primary again.
pub fn cond_initial_or_skip_sync(
    adm: &dyn DrbdAdm,
    tracker: &StateTracker,
    link: &dyn ControllerLink,
    rsc: &mut DrbdResource,
    timeout: Duration,
) -> Result<()> {
    if let Some(node) = rsc.definition.primary_set_on() {
        trace!("{}: initial primary was {node}", rsc.suffixed_name());
        return Ok(());
    }
    if let Some(node) = current_primary(tracker, rsc)? {
        return record_primary_set(rsc, &node);
    }

    if rsc.create_primary && !rsc.primary && metadata_fresh(rsc) {
        maybe_promote_on_create(adm, tracker, rsc, timeout)?;
        record_primary_set(rsc, &rsc.node_name)
    } else if !rsc.is_diskless() {
        maybe_request_initial_sync(adm, link, rsc)
    } else {
        Ok(())
    }
}

/// The node DRBD currently reports as primary for the resource, this one or a peer.
fn current_primary(tracker: &StateTracker, rsc: &DrbdResource) -> Result<Option<String>> {
    let name = rsc.suffixed_name();
    let state = match tracker.get_resource(&name) {
        Ok(state) => state,
        Err(Error::NoInitialState) => {
            return Err(Error::storage(
                Failure::new(abort_msg(&name)).cause("No initial DRBD state"),
            ))
        }
        Err(e) => return Err(e),
    };
    Ok(state.and_then(|state| {
        if state.role == Role::Primary {
            return Some(rsc.node_name.clone());
        }
        state
            .connections
            .iter()
            .find(|(_, conn)| conn.role == Role::Primary)
            .map(|(node, _)| node.clone())
    }))
}

/// Every volume still in use got its metadata created by this process. Data that was already
/// there is never forced primary.
fn metadata_fresh(rsc: &DrbdResource) -> bool {
    let mut volumes = rsc
        .volumes
        .values()
        .filter(|v| !v.flags.is_marked_for_removal())
        .peekable();
    volumes.peek().is_some() && volumes.all(|v| v.metadata_is_new)
}

fn record_primary_set(rsc: &DrbdResource, node: &str) -> Result<()> {
    let name = rsc.suffixed_name();
    rsc.definition
        .props
        .set(PROP_PRIMARY_SET, node)
        .map_err(|e| {
            Error::storage(
                Failure::new(abort_msg(&name))
                    .cause("Failed to record the initial primary")
                    .with_source(e),
            )
        })?;
    info!("{name}: initial primary is {node}");
    Ok(())
}

/// Ask the controller for a primary, whether or not the data looks initialized already.
pub fn maybe_request_initial_sync(
    adm: &dyn DrbdAdm,
    link: &dyn ControllerLink,
    rsc: &DrbdResource,
) -> Result<()> {
    let already_initialized = !metadata::all_volumes_metadata_new(adm, rsc)?;
    trace!(
        "Requesting primary on {}; already initialized: {already_initialized}",
        rsc.suffixed_name()
    );
    link.notify(Notification::RequestPrimary {
        // the controller knows the resource by its plain name
        resource: rsc.definition.name.clone(),
        node: rsc.node_name.clone(),
        already_initialized,
    });
    Ok(())
}

/// Force primary once to start the initial full sync of fat volumes and create the requested
/// filesystems, then go back to secondary.
pub fn maybe_promote_on_create(
    adm: &dyn DrbdAdm,
    tracker: &StateTracker,
    rsc: &mut DrbdResource,
    timeout: Duration,
) -> Result<()> {
    let name = rsc.suffixed_name();
    rsc.create_primary = false;

    let have_fat = rsc.definition.force_initial_sync || rsc.volumes.values().any(|v| !v.thin);
    let filesystems: Vec<(u32, String, String)> = rsc
        .volumes
        .values()
        .filter(|v| !v.flags.is_marked_for_removal())
        .filter_map(|v| {
            let fs_type = rsc.definition.volume(v.vlm_nr)?.fs_type.clone()?;
            Some((v.vlm_nr, v.generated_device_path(), fs_type))
        })
        .collect();

    if !have_fat && filesystems.is_empty() {
        debug!("{name}: thin volumes only, no initial sync needed");
        return Ok(());
    }
    if have_fat {
        wait_for_valid_state_for_primary(tracker, &name, timeout)?;
    }

    info!("Setting resource primary on {name}");
    // --force: quorum may be configured while the peers did not connect yet
    let guard = PrimaryGuard::acquire(adm, &name, true).map_err(|e| {
        Error::storage(
            Failure::new(abort_msg(&name))
                .cause(format!("Starting the initial resync of the DRBD resource '{name}' failed"))
                .with_source(e),
        )
    })?;

    for (vlm_nr, device, fs_type) in &filesystems {
        adm.make_filesystem(device, fs_type).map_err(|e| {
            Error::volume(
                Failure::new(abort_vlm_msg(&name, *vlm_nr))
                    .cause(format!("Failed to create a {fs_type} filesystem on {device}"))
                    .with_source(e),
            )
        })?;
        info!("created {fs_type} filesystem on {device}");
    }

    guard.release().map_err(|e| {
        Error::storage(
            Failure::new(abort_msg(&name))
                .cause("Failed to become secondary again after the initial promotion")
                .with_source(e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drbd::events::EventsMonitor,
        test_env::{data_device, drbd_resource, drbd_resource_with, FakeAdm, RecordingLink},
    };
    use std::sync::Arc;

    fn tracker(lines: &[&str]) -> Arc<StateTracker> {
        let tracker = Arc::new(StateTracker::new());
        let mut monitor = EventsMonitor::new(Arc::clone(&tracker));
        for line in lines {
            monitor.receive_line(line).unwrap();
        }
        tracker
    }

    #[test]
    fn wait_times_out_and_deregisters() {
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists device name:r0 volume:0 minor:1000 disk:Attaching client:no",
            "exists -",
        ]);
        let err = wait_for_valid_state_for_primary(&tracker, "r0", Duration::from_millis(20))
            .unwrap_err();
        assert!(err.to_string().contains("did not get ready within 20ms"));
        assert_eq!(tracker.observer_count(), 0);
    }

    #[test]
    fn wait_wakes_up_on_disk_change() {
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists device name:r0 volume:0 minor:1000 disk:Attaching client:no",
            "exists -",
        ]);
        let feeder = Arc::clone(&tracker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut monitor = EventsMonitor::new(Arc::clone(&feeder));
            monitor.receive_line("exists -").unwrap();
            monitor
                .receive_line("change device name:r0 volume:0 disk:Inconsistent")
                .unwrap();
        });
        wait_for_valid_state_for_primary(&tracker, "r0", Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(tracker.observer_count(), 0);
    }

    #[test]
    fn request_primary_when_nobody_was_primary() {
        let adm = FakeAdm::new();
        let link = RecordingLink::default();
        let tracker = tracker(&["exists -"]);
        let mut rsc = drbd_resource("r0", &[0]);
        rsc.volumes.get_mut(&0).unwrap().metadata_is_new = true;

        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert_eq!(
            link.messages(),
            vec![Notification::RequestPrimary {
                resource: "r0".to_string(),
                node: "alpha".to_string(),
                already_initialized: false,
            }]
        );
    }

    #[test]
    fn thin_only_create_primary_stays_secondary() {
        let adm = FakeAdm::new();
        let link = RecordingLink::default();
        let tracker = tracker(&["exists -"]);
        let mut rsc = drbd_resource("r0", &[0]);
        rsc.create_primary = true;
        let vlm = rsc.volumes.get_mut(&0).unwrap();
        vlm.thin = true;
        vlm.metadata_is_new = true;

        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert!(!rsc.create_primary);
        assert_eq!(adm.count("primary"), 0);
        assert!(link.messages().is_empty());
        assert_eq!(rsc.definition.primary_set_on().as_deref(), Some("alpha"));
    }

    #[test]
    fn primary_peer_is_recorded_instead_of_requested() {
        let adm = FakeAdm::new();
        let link = RecordingLink::default();
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists connection name:r0 peer-node-id:1 conn-name:beta connection:Connected role:Primary",
            "exists device name:r0 volume:0 minor:1000 disk:UpToDate client:no",
            "exists -",
        ]);
        let mut rsc = drbd_resource("r0", &[0]);

        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert!(link.messages().is_empty());
        assert_eq!(rsc.definition.primary_set_on().as_deref(), Some("beta"));

        // recorded once, nothing is asked for again
        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert!(link.messages().is_empty());
        assert!(adm.calls().is_empty());
    }

    #[test]
    fn local_primary_is_recorded() {
        let adm = FakeAdm::new();
        let link = RecordingLink::default();
        let tracker = tracker(&[
            "exists resource name:r0 role:Primary",
            "exists device name:r0 volume:0 minor:1000 disk:UpToDate client:no",
            "exists -",
        ]);
        let mut rsc = drbd_resource("r0", &[0]);

        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert!(link.messages().is_empty());
        assert_eq!(rsc.definition.primary_set_on().as_deref(), Some("alpha"));
    }

    #[test]
    fn existing_data_is_not_forced_primary() {
        let adm = FakeAdm::new();
        let link = RecordingLink::default();
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists device name:r0 volume:0 minor:1000 disk:UpToDate client:no",
            "exists -",
        ]);
        let mut rsc = drbd_resource("r0", &[0]);
        rsc.create_primary = true;
        adm.set_gid(&data_device("r0", 0), "ABCDEF0123456789:0:0:0\n");

        cond_initial_or_skip_sync(&adm, &tracker, &link, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap();
        assert_eq!(adm.count("primary"), 0);
        assert_eq!(
            link.messages(),
            vec![Notification::RequestPrimary {
                resource: "r0".to_string(),
                node: "alpha".to_string(),
                already_initialized: true,
            }]
        );
        assert!(rsc.definition.primary_set_on().is_none());
    }

    #[test]
    fn failed_mkfs_still_demotes() {
        let adm = FakeAdm::new();
        adm.fail("mkfs");
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists device name:r0 volume:0 minor:1000 disk:Inconsistent client:no",
            "exists -",
        ]);
        let mut rsc = drbd_resource_with("r0", &[0], |def| {
            def.volumes.get_mut(&0).unwrap().fs_type = Some("xfs".to_string());
        });
        rsc.create_primary = true;

        let err = maybe_promote_on_create(&adm, &tracker, &mut rsc, VALID_STATE_FOR_PRIMARY_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, Error::Volume(_)));
        assert_eq!(adm.count("primary r0 --force"), 1);
        assert_eq!(adm.count("secondary r0"), 1);
    }
}
