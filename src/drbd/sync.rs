// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Pulls the tracker's view of a resource into the layer data. Never runs an external command.

use log::trace;

use super::tracker::{ConnectionState, DiskState, Role, StateTracker};
use crate::{
    error::{abort_msg, Error, Failure, Result},
    layer::DrbdResource,
};

pub fn update_to_current_state(tracker: &StateTracker, rsc: &mut DrbdResource) -> Result<()> {
    let name = rsc.suffixed_name();
    trace!("synchronizing with the DRBD state of resource {name}");

    // Changes made outside of the layer data (storage pool properties, for example) do not mark
    // the resource, so every synchronized resource is adjusted.
    rsc.adjust_required = true;
    if rsc.flags.is_diskless() {
        for vlm in rsc.volumes.values_mut() {
            vlm.check_metadata = false;
        }
    }

    let state = match tracker.get_resource(&name) {
        Ok(state) => state,
        Err(Error::NoInitialState) => {
            return Err(Error::storage(
                Failure::new(abort_msg(&name)).cause("Need initial DRBD state"),
            ));
        }
        Err(e) => return Err(e),
    };

    let Some(mut state) = state else {
        rsc.mark_nonexistent();
        return Ok(());
    };

    rsc.exists = true;
    rsc.primary = state.role == Role::Primary;
    if state.role == Role::Unknown {
        rsc.adjust_required = true;
    }
    rsc.promotion_score = state.promotion_score;
    rsc.may_promote = state.may_promote;

    for peer in rsc.peers.iter() {
        let reconnect = match state.connection(&peer.node_name) {
            None => true,
            Some(conn) => match conn.state {
                ConnectionState::StandAlone
                | ConnectionState::Disconnecting
                | ConnectionState::Unconnected
                | ConnectionState::Timeout
                | ConnectionState::BrokenPipe
                | ConnectionState::NetworkFailure
                | ConnectionState::ProtocolError
                | ConnectionState::TearDown
                | ConnectionState::Unknown => true,
                ConnectionState::Connecting | ConnectionState::Connected => false,
            },
        };
        if reconnect {
            trace!("{name}: connection to {} needs an adjust", peer.node_name);
            rsc.adjust_required = true;
        }
    }

    for vlm in rsc.volumes.values_mut() {
        match state.volumes.remove(&vlm.vlm_nr) {
            Some(observed) => {
                vlm.exists = true;
                match observed.disk_state {
                    DiskState::Diskless => {
                        if observed.client {
                            vlm.check_metadata = false;
                        } else {
                            // lost the disk; its metadata has to be checked once it is back
                            vlm.failed = true;
                            vlm.check_metadata = true;
                            rsc.adjust_required = true;
                        }
                    }
                    DiskState::Detaching | DiskState::Failed => {
                        vlm.failed = true;
                        rsc.adjust_required = true;
                    }
                    DiskState::Negotiating | DiskState::Unknown => rsc.adjust_required = true,
                    DiskState::UpToDate
                    | DiskState::Consistent
                    | DiskState::Inconsistent
                    | DiskState::Outdated => {
                        vlm.has_metadata = true;
                        vlm.check_metadata = false;
                        vlm.failed = false;
                        vlm.has_disk = true;
                    }
                    DiskState::Attaching => vlm.has_disk = true,
                }
            }
            None => {
                rsc.adjust_required = true;
                vlm.exists = false;
            }
        }
        vlm.metadata_is_new = false;
    }

    if !state.volumes.is_empty() {
        trace!(
            "{name}: DRBD reports unexpected volumes {:?}",
            state.volumes.keys().collect::<Vec<_>>()
        );
        rsc.adjust_required = true;
    }

    rsc.suspended = state.suspended_user.unwrap_or(false);
    Ok(())
}
