// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! peers.rs
//!
//! Cleanup of peers that are being removed. DRBD keeps a bitmap slot per peer node id; a peer
//! that is gone for good has to be deleted from the kernel and forgotten in the metadata so the
//! slot can be reused.

use log::{debug, info, warn};

use super::{
    adm::{AdjustOptions, DrbdAdm},
    tracker::StateTracker,
};
use crate::{
    error::{abort_msg, Error, Failure, Result},
    exec::ExecutionError,
    layer::{DrbdResource, PeerResource},
    props::{parse_node_ids, KEY_DRBD_NODE_IDS_TO_RESET},
    state::StateError,
};

/// Result of removing one peer.
#[derive(Debug)]
pub enum CleanupOutcome {
    Done,
    /// The metadata is not accessible right now; the peer is forgotten once it is.
    Deferred,
    /// A command failed, but the peer is evidently gone already.
    Benign,
    Failed(ExecutionError),
}

fn props_failure(rsc_name: &str, err: StateError) -> Error {
    Error::storage(
        Failure::new(abort_msg(rsc_name))
            .cause("failed to persist the node ids to reset")
            .with_source(err),
    )
}

/// Remove a single peer: `del-peer`, then `forget-peer` unless the disk is skipped.
///
/// Two peers deleted at the same time race each other: the slower one sees an unknown
/// connection on `del-peer` and possibly fails `forget-peer` as well. That is only an error if
/// the tracker still knows a connection to the peer.
pub fn cleanup_deleted_peer(
    adm: &dyn DrbdAdm,
    tracker: &StateTracker,
    rsc: &DrbdResource,
    peer: &PeerResource,
    skip_disk: bool,
) -> Result<CleanupOutcome> {
    let name = rsc.suffixed_name();
    // kernel only, works without metadata
    let del_peer_err = adm.delete_peer(&name, peer.node_id.0).err();

    if rsc.is_diskless() {
        return Ok(CleanupOutcome::Done);
    }

    if skip_disk {
        rsc.props
            .append_to_list(KEY_DRBD_NODE_IDS_TO_RESET, &peer.node_id.to_string())
            .map_err(|e| props_failure(&name, e))?;
        debug!(
            "{name}: deferring forget-peer of node id {} until the disk is back",
            peer.node_id
        );
        return Ok(CleanupOutcome::Deferred);
    }

    let forget_err = match adm.forget_peer(&name, peer.node_id.0) {
        Ok(()) => return Ok(CleanupOutcome::Done),
        Err(e) => e,
    };

    if peer.is_diskless() {
        debug!("Ignoring error caused by forget-peer for a diskless resource: {forget_err}");
        return Ok(CleanupOutcome::Benign);
    }

    let state = match tracker.get_resource(&name) {
        Ok(state) => state,
        Err(Error::NoInitialState) => {
            return Err(Error::Implementation(format!(
                "peer cleanup of '{name}' ran without an initial DRBD state"
            )));
        }
        Err(e) => return Err(e),
    };
    match state {
        Some(state) if state.connection(&peer.node_name).is_some() => Ok(
            CleanupOutcome::Failed(del_peer_err.unwrap_or(forget_err)),
        ),
        _ => {
            debug!("del-peer and forget-peer failed, but the peer {} is gone. noop", peer.node_name);
            Ok(CleanupOutcome::Benign)
        }
    }
}

/// Run the cleanup for every peer flagged for removal, diskless peers included.
pub fn cleanup_deleted_peers(
    adm: &dyn DrbdAdm,
    tracker: &StateTracker,
    rsc: &DrbdResource,
    skip_disk: bool,
) -> Result<()> {
    let name = rsc.suffixed_name();
    for peer in rsc.peers.iter().filter(|p| p.flags.is_marked_for_removal()) {
        match cleanup_deleted_peer(adm, tracker, rsc, peer, skip_disk)? {
            CleanupOutcome::Done | CleanupOutcome::Deferred | CleanupOutcome::Benign => {}
            CleanupOutcome::Failed(e) => {
                return Err(Error::resource_cmd(
                    &name,
                    format!("Failed to adjust DRBD resource {name}"),
                    e,
                ));
            }
        }
    }
    Ok(())
}

/// Forget every node id in `ids` that no longer belongs to this resource, then adjust.
pub fn forget_peers_cleanup(adm: &dyn DrbdAdm, rsc: &DrbdResource, ids: Option<&str>) -> Result<()> {
    let name = rsc.suffixed_name();
    let known: Vec<u32> = rsc.all_node_ids().into_iter().map(|id| id.0).collect();
    let stale = ids
        .map(parse_node_ids)
        .unwrap_or_default()
        .into_iter()
        .filter(|id| !known.contains(id));

    for node_id in stale {
        match adm.forget_peer(&name, node_id) {
            Ok(()) => info!("{name}: forgot node id {node_id}"),
            Err(e) => debug!("ignoring error in forget-peer {node_id} after restoring: {e}"),
        }
    }

    adm.adjust(&name, AdjustOptions::default())
        .map_err(|e| Error::resource_cmd(&name, format!("Failed to adjust DRBD resource {name}"), e))
}

/// Replay the forget-peer calls deferred while the disk was skipped.
pub fn recover_after_skip_disk(adm: &dyn DrbdAdm, rsc: &DrbdResource) -> Result<()> {
    let name = rsc.suffixed_name();
    if let Some(ids) = rsc.props.get(KEY_DRBD_NODE_IDS_TO_RESET) {
        if !ids.trim().is_empty() {
            warn!("{name}: replaying deferred forget-peer for node ids {ids}");
            forget_peers_cleanup(adm, rsc, Some(&ids))?;
        }
    }
    rsc.props
        .remove(KEY_DRBD_NODE_IDS_TO_RESET)
        .map_err(|e| props_failure(&name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drbd::events::EventsMonitor,
        flags::ResourceFlag,
        test_env::{drbd_resource, peer, FakeAdm},
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

    fn leaving_peer() -> PeerResource {
        let mut p = peer("beta", 1);
        p.flags.insert(ResourceFlag::Delete);
        p
    }

    #[test]
    fn both_failures_without_connection_are_benign() {
        let adm = FakeAdm::new();
        adm.fail("del-peer");
        adm.fail("forget-peer");
        let tracker = tracker(&["exists resource name:r0 role:Secondary", "exists -"]);
        let rsc = drbd_resource("r0", &[0]);

        let outcome = cleanup_deleted_peer(&adm, &tracker, &rsc, &leaving_peer(), false).unwrap();
        assert!(matches!(outcome, CleanupOutcome::Benign));
    }

    #[test]
    fn live_connection_propagates_del_peer_failure() {
        let adm = FakeAdm::new();
        adm.fail("del-peer");
        adm.fail("forget-peer");
        let tracker = tracker(&[
            "exists resource name:r0 role:Secondary",
            "exists connection name:r0 peer-node-id:1 conn-name:beta connection:Connected",
            "exists -",
        ]);
        let rsc = drbd_resource("r0", &[0]);

        let outcome = cleanup_deleted_peer(&adm, &tracker, &rsc, &leaving_peer(), false).unwrap();
        let CleanupOutcome::Failed(err) = outcome else {
            panic!("expected a failure, got {outcome:?}");
        };
        assert!(err.to_string().contains("del-peer"));

        let mut rsc = rsc;
        rsc.peers.push(leaving_peer());
        assert!(matches!(
            cleanup_deleted_peers(&adm, &tracker, &rsc, false),
            Err(Error::Resource(_))
        ));
    }

    #[test]
    fn diskless_peer_failure_is_swallowed() {
        let adm = FakeAdm::new();
        adm.fail("forget-peer");
        let tracker = tracker(&["exists -"]);
        let rsc = drbd_resource("r0", &[0]);
        let mut p = leaving_peer();
        p.flags.insert(ResourceFlag::DrbdDiskless);

        let outcome = cleanup_deleted_peer(&adm, &tracker, &rsc, &p, false).unwrap();
        assert!(matches!(outcome, CleanupOutcome::Benign));
    }

    #[test]
    fn missing_initial_state_is_a_defect() {
        let adm = FakeAdm::new();
        adm.fail("forget-peer");
        let tracker = StateTracker::new();
        let rsc = drbd_resource("r0", &[0]);
        let err = cleanup_deleted_peer(&adm, &tracker, &rsc, &leaving_peer(), false).unwrap_err();
        assert!(err.is_implementation());
    }

    #[test]
    fn skip_disk_defers_and_replays() {
        let adm = FakeAdm::new();
        let tracker = tracker(&["exists -"]);
        let rsc = drbd_resource("r0", &[0]);

        let outcome = cleanup_deleted_peer(&adm, &tracker, &rsc, &leaving_peer(), true).unwrap();
        assert!(matches!(outcome, CleanupOutcome::Deferred));
        assert_eq!(adm.count("forget-peer"), 0);
        assert_eq!(
            rsc.props.get(KEY_DRBD_NODE_IDS_TO_RESET).as_deref(),
            Some("1")
        );

        recover_after_skip_disk(&adm, &rsc).unwrap();
        assert_eq!(adm.count("forget-peer r0 1"), 1);
        assert_eq!(adm.count("adjust r0"), 1);
        assert!(rsc.props.get(KEY_DRBD_NODE_IDS_TO_RESET).is_none());
    }

    #[test]
    fn replay_skips_current_node_ids() {
        let adm = FakeAdm::new();
        let mut rsc = drbd_resource("r0", &[0]);
        rsc.peers.push(peer("beta", 1));

        forget_peers_cleanup(&adm, &rsc, Some("0,1,4")).unwrap();
        assert_eq!(adm.count("forget-peer"), 1);
        assert_eq!(adm.count("forget-peer r0 4"), 1);
    }
}
