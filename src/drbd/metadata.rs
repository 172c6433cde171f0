// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! metadata.rs
//!
//! DRBD metadata lifecycle of single volumes: detection, creation and the generation identifier
//! bookkeeping used to skip the initial full synchronization.

use log::{info, trace};

use super::adm::{ActivityLog, DrbdAdm, MdFlavor, SetGi};
use crate::{
    error::{abort_msg, abort_vlm_msg, Error, Failure, Result},
    flags::DrbdRscFlag,
    layer::{DrbdResource, DrbdVolume},
};

/// Current generation identifier of metadata that was never used.
pub const DRBD_NEW_GI: &str = "0000000000000004";

fn md_path<'a>(rsc_name: &str, vlm: &'a DrbdVolume) -> Result<&'a str> {
    vlm.md_device().ok_or_else(|| {
        Error::volume(
            Failure::new(abort_vlm_msg(rsc_name, vlm.vlm_nr))
                .cause("the layer below did not provide a device for the DRBD metadata"),
        )
    })
}

/// Whether the volume carries metadata DRBD can use.
///
/// A volume that already has a disk and is not marked for a metadata check is taken as valid
/// without touching the device.
pub fn has_valid_metadata(adm: &dyn DrbdAdm, rsc_name: &str, vlm: &DrbdVolume) -> Result<bool> {
    if !vlm.check_metadata && vlm.has_disk {
        return Ok(true);
    }

    let path = md_path(rsc_name, vlm)?;
    let external = vlm.has_external_md();
    let signature = adm.has_md_signature(path, external).map_err(|e| {
        Error::volume(
            Failure::new(abort_vlm_msg(rsc_name, vlm.vlm_nr))
                .cause(format!(
                    "Failed to access DRBD super-block of volume {rsc_name}/{}",
                    vlm.vlm_nr
                ))
                .with_source(e),
        )
    })?;

    let valid = if signature {
        let readable = adm
            .has_metadata(path, vlm.minor, MdFlavor::for_external(external))
            .map_err(|e| {
                Error::volume_cmd(
                    rsc_name,
                    vlm.vlm_nr,
                    format!(
                        "Failed to check DRBD meta-data integrity of volume {rsc_name}/{}",
                        vlm.vlm_nr
                    ),
                    e,
                )
            })?;
        if !readable {
            return Err(Error::volume(
                Failure::new(abort_vlm_msg(rsc_name, vlm.vlm_nr))
                    .cause("Corrupted DRBD metadata: existing metadata was found, but drbdmeta could not read it")
                    .correction("Check if the DRBD-utils version matches the DRBD kernel version."),
            ));
        }
        true
    } else {
        false
    };
    trace!("{rsc_name}/{}: found metadata: {valid}", vlm.vlm_nr);
    Ok(valid)
}

/// Volumes on thin storage do not need the initial full sync unless it is forced.
pub fn skip_initial_sync(rsc: &DrbdResource, vlm: &DrbdVolume) -> bool {
    vlm.thin && !rsc.definition.force_initial_sync
}

fn expected_current_gi(rsc: &DrbdResource, vlm_nr: u32) -> Result<String> {
    rsc.definition
        .volume(vlm_nr)
        .and_then(|d| d.current_gi.clone())
        .ok_or_else(|| {
            let name = rsc.suffixed_name();
            Error::storage(
                Failure::new(abort_msg(&name))
                    .cause(format!(
                        "Meta data creation for resource '{name}' volume {vlm_nr} failed: the volume \
                         uses thin provisioning, but no initial DRBD current generation is set on the \
                         volume definition"
                    ))
                    .correction(
                        "Set the initial DRBD current generation on the volume definition or recreate it",
                    ),
            )
        })
}

/// Create fresh metadata. Thin volumes get the expected generation identifier programmed so
/// that DRBD skips the initial full sync.
pub fn create(adm: &dyn DrbdAdm, rsc: &mut DrbdResource, vlm_nr: u32) -> Result<()> {
    let name = rsc.suffixed_name();
    let Some(vlm) = rsc.volumes.get(&vlm_nr) else {
        return Err(Error::Implementation(format!(
            "metadata creation for unknown volume {name}/{vlm_nr}"
        )));
    };
    let set_gi = if skip_initial_sync(rsc, vlm) {
        Some(SetGi {
            node_id: rsc.node_id.0,
            minor: vlm.minor,
            md_path: md_path(&name, vlm)?.to_string(),
            current_gi: expected_current_gi(rsc, vlm_nr)?,
            history: None,
            up_to_date: !rsc.drbd_flags.contains(DrbdRscFlag::Initialized),
            internal: !vlm.has_external_md(),
        })
    } else {
        None
    };

    let al = ActivityLog {
        stripes: rsc.definition.al_stripes,
        stripe_size_kib: rsc.definition.al_stripe_size_kib,
    };
    adm.create_md(&name, vlm_nr, rsc.peer_slots, al).map_err(|e| {
        Error::volume_cmd(
            &name,
            vlm_nr,
            format!("Failed to create meta-data for DRBD volume {name}/{vlm_nr}"),
            e,
        )
    })?;
    info!("DRBD meta data created for {name}/{vlm_nr}");
    if let Some(vlm) = rsc.volumes.get_mut(&vlm_nr) {
        vlm.metadata_is_new = true;
    }

    if let Some(args) = set_gi {
        adm.set_gi(&args).map_err(|e| {
            Error::volume_cmd(
                &name,
                vlm_nr,
                format!("Failed to set the generation identifier of DRBD volume {name}/{vlm_nr}"),
                e,
            )
        })?;
        info!("DRBD skipping initial sync for {name}/{vlm_nr}");
    }
    Ok(())
}

/// Metadata has to be recreated for a resource that was never initialized, asks for it, and is
/// not running yet.
pub fn needs_new_metadata(
    adm: &dyn DrbdAdm,
    rsc: &DrbdResource,
    status: Option<&str>,
) -> Result<bool> {
    if rsc.drbd_flags.contains(DrbdRscFlag::Initialized)
        || !rsc.drbd_flags.contains(DrbdRscFlag::ForceNewMetadata)
    {
        return Ok(false);
    }
    let name = rsc.suffixed_name();
    let is_up = match status {
        Some(status) => status.contains(&format!("{name} role:")),
        None => adm
            .status_resource_up(&name)
            .map_err(|e| Error::resource_cmd(&name, "Failed to query the DRBD status", e))?,
    };
    Ok(!is_up)
}

/// Whether no volume of the resource was ever written: metadata created in this pass, or a
/// current generation identifier that is still the "new" one or the one configured on the
/// volume definition. Only thin volumes are required to have a configured identifier.
pub fn all_volumes_metadata_new(adm: &dyn DrbdAdm, rsc: &DrbdResource) -> Result<bool> {
    let name = rsc.suffixed_name();
    for vlm in rsc.volumes.values() {
        if vlm.metadata_is_new {
            continue;
        }
        let expected = rsc
            .definition
            .volume(vlm.vlm_nr)
            .and_then(|d| d.current_gi.as_deref());
        let path = md_path(&name, vlm)?;
        let gids = adm
            .current_gid(path, vlm.minor, MdFlavor::for_external(vlm.has_external_md()))
            .map_err(|e| {
                Error::storage(
                    Failure::new(abort_msg(&name))
                        .cause("Could not check if metadata is new")
                        .with_source(e),
                )
            })?;
        let current = gids.split(':').next().unwrap_or_default().trim();
        let configured = expected.is_some_and(|gi| current.eq_ignore_ascii_case(gi));
        if !(configured || current == DRBD_NEW_GI) {
            return Ok(false);
        }
    }
    Ok(true)
}
