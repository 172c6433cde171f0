// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! resize.rs
//!
//! Shrinks run before the layers below shrink, grows after DRBD was adjusted to the grown
//! backing devices. No node resizes while a peer is still shrinking.

use log::{debug, info};

use super::adm::DrbdAdm;
use crate::{
    error::{Error, Result},
    flags::VolumeFlag,
    layer::{DrbdResource, DrbdVolume, SizeState},
};

/// Compare the device size with the requested one and record the result in the volume.
///
/// Only volumes flagged DRBD_RESIZE that have a disk are considered. The device size can only be
/// read on Linux; elsewhere the device only exists while it is primary.
pub fn needs_resize(adm: &dyn DrbdAdm, rsc_name: &str, vlm: &mut DrbdVolume) -> Result<bool> {
    let mut needs = vlm.flags.contains(VolumeFlag::DrbdResize) && vlm.has_disk;
    if needs && cfg!(target_os = "linux") {
        let sectors = adm.size_in_sectors(vlm.minor).map_err(|e| {
            Error::volume_cmd(
                rsc_name,
                vlm.vlm_nr,
                format!("Failed to read the size of /dev/drbd{}", vlm.minor),
                e,
            )
        })?;
        let actual_kib = sectors / 2;
        vlm.size_state = if vlm.usable_size_kib > actual_kib {
            SizeState::TooSmall
        } else if vlm.usable_size_kib < actual_kib {
            SizeState::TooLarge
        } else {
            needs = false;
            SizeState::AsExpected
        };
        debug!(
            "{rsc_name}/{}: {actual_kib} KiB, {} KiB requested: {:?}",
            vlm.vlm_nr, vlm.usable_size_kib, vlm.size_state
        );
    }
    Ok(needs)
}

/// Every local volume has a consistent RESIZE/DRBD_RESIZE pair and no peer is mid-shrink.
pub fn resize_allowed(rsc: &DrbdResource) -> bool {
    rsc.volumes
        .values()
        .all(|v| v.flags.resize_flags_consistent())
        && !peer_shrinking(rsc)
}

pub fn peer_shrinking(rsc: &DrbdResource) -> bool {
    rsc.peers
        .iter()
        .flat_map(|p| p.volumes.values())
        .any(|v| v.flags.is_peer_shrinking())
}

pub fn shrink_if_necessary(adm: &dyn DrbdAdm, rsc: &mut DrbdResource) -> Result<()> {
    if rsc.is_diskless() || peer_shrinking(rsc) {
        return Ok(());
    }
    let name = rsc.suffixed_name();
    for vlm in rsc.volumes.values_mut() {
        if needs_resize(adm, &name, vlm)? && vlm.size_state == SizeState::TooLarge {
            adm.resize(&name, vlm.vlm_nr, false, Some(vlm.usable_size_kib))
                .map_err(|e| {
                    Error::resource_cmd(&name, format!("Failed to shrink DRBD resource {name}"), e)
                })?;
            // stays TooLarge: the layers below shrink next and DRBD grows back onto what is left
            info!("DRBD shrunk {name}/{}", vlm.vlm_nr);
        }
    }
    Ok(())
}

pub fn grow_if_necessary(adm: &dyn DrbdAdm, rsc: &mut DrbdResource) -> Result<()> {
    let name = rsc.suffixed_name();
    for vlm in rsc.volumes.values_mut() {
        if needs_resize(adm, &name, vlm)? && vlm.size_state == SizeState::TooSmall {
            // TODO: decide whether --assume-clean is safe for partially thin backing devices
            adm.resize(&name, vlm.vlm_nr, vlm.thin, None).map_err(|e| {
                Error::resource_cmd(&name, format!("Failed to resize DRBD resource {name}"), e)
            })?;
            info!("DRBD resized {name}/{}", vlm.vlm_nr);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::{drbd_resource, peer, FakeAdm};

    fn resizing(rsc: &mut DrbdResource, usable_kib: u64) {
        let vlm = rsc.volumes.get_mut(&0).unwrap();
        vlm.flags.insert(VolumeFlag::Resize);
        vlm.flags.insert(VolumeFlag::DrbdResize);
        vlm.has_disk = true;
        vlm.usable_size_kib = usable_kib;
    }

    #[test]
    fn size_state_follows_device_size() {
        let adm = FakeAdm::new();
        adm.set_size_sectors(1000, 200);
        let mut rsc = drbd_resource("r0", &[0]);

        resizing(&mut rsc, 200);
        let vlm = rsc.volumes.get_mut(&0).unwrap();
        assert!(needs_resize(&adm, "r0", vlm).unwrap());
        assert_eq!(vlm.size_state, SizeState::TooSmall);

        vlm.usable_size_kib = 50;
        assert!(needs_resize(&adm, "r0", vlm).unwrap());
        assert_eq!(vlm.size_state, SizeState::TooLarge);

        vlm.usable_size_kib = 100;
        assert!(!needs_resize(&adm, "r0", vlm).unwrap());
        assert_eq!(vlm.size_state, SizeState::AsExpected);
    }

    #[test]
    fn volume_without_disk_is_never_resized() {
        let adm = FakeAdm::new();
        let mut rsc = drbd_resource("r0", &[0]);
        resizing(&mut rsc, 200);
        let vlm = rsc.volumes.get_mut(&0).unwrap();
        vlm.has_disk = false;
        assert!(!needs_resize(&adm, "r0", vlm).unwrap());
        assert!(adm.calls().is_empty());
    }

    #[test]
    fn peer_shrink_blocks_resize() {
        let adm = FakeAdm::new();
        adm.set_size_sectors(1000, 400);
        let mut rsc = drbd_resource("r0", &[0]);
        resizing(&mut rsc, 100);
        let mut shrinking = peer("beta", 1);
        shrinking
            .volumes
            .get_mut(&0)
            .unwrap()
            .flags
            .insert(VolumeFlag::DrbdResize);
        rsc.peers.push(shrinking);

        assert!(!resize_allowed(&rsc));
        shrink_if_necessary(&adm, &mut rsc).unwrap();
        assert_eq!(adm.count("resize"), 0);

        rsc.peers.clear();
        shrink_if_necessary(&adm, &mut rsc).unwrap();
        assert_eq!(adm.count("resize r0/0 size=100"), 1);
        assert_eq!(rsc.volumes[&0].size_state, SizeState::TooLarge);
    }

    #[test]
    fn grow_uses_assume_clean_for_thin_volumes() {
        let adm = FakeAdm::new();
        adm.set_size_sectors(1000, 200);
        let mut rsc = drbd_resource("r0", &[0]);
        resizing(&mut rsc, 200);
        rsc.volumes.get_mut(&0).unwrap().thin = true;

        grow_if_necessary(&adm, &mut rsc).unwrap();
        assert_eq!(adm.count("resize r0/0 assume-clean"), 1);
    }
}
