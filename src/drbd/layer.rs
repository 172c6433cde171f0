// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! layer.rs
//!
//! The DRBD layer reconciler. For every resource of a device manager pass it decides between
//! deleting, adjusting or leaving the DRBD device alone, and sequences metadata, configuration
//! file, peer cleanup, resize and promotion handling around `drbdadm adjust`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};

use super::{
    adm::{AdjustOptions, DrbdAdm},
    conf_file::ResFiles,
    metadata, peers, promote, resize, sync,
    tracker::StateTracker,
};
use crate::{
    controller::{ControllerLink, Notification},
    error::{abort_msg, Error, Failure, Result},
    flags::ResourceFlag,
    layer::{ChildProcessor, DrbdResource},
    report::{EntryKind, Report},
};

/// Caches that are valid for one device manager pass only.
#[derive(Debug, Default, Clone)]
pub struct PassContext {
    /// `drbdsetup status` output captured at the start of the pass.
    pub status: Option<String>,
    /// Lower case names of the resources `drbdadm adjust` would change. `None` means unknown, in
    /// which case every resource is adjusted.
    pub adjustable: Option<Vec<String>>,
}

impl PassContext {
    pub fn requires_adjust(&self, suffixed_name: &str) -> bool {
        self.adjustable
            .as_ref()
            .map_or(true, |names| names.contains(&suffixed_name.to_lowercase()))
    }
}

#[derive(Debug, Clone)]
pub struct LayerSettings {
    /// Ask `drbdadm -d adjust all` which resources need an adjust at all.
    pub use_adjustable_list: bool,
    pub primary_timeout: Duration,
    /// DRBD ports have to be opened in the host firewall.
    pub windows: bool,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            use_adjustable_list: true,
            primary_timeout: promote::VALID_STATE_FOR_PRIMARY_TIMEOUT,
            windows: cfg!(windows),
        }
    }
}

pub struct DrbdLayer {
    adm: Arc<dyn DrbdAdm>,
    tracker: Arc<StateTracker>,
    link: Arc<dyn ControllerLink>,
    files: ResFiles,
    settings: LayerSettings,
}

impl DrbdLayer {
    pub fn new(
        adm: Arc<dyn DrbdAdm>,
        tracker: Arc<StateTracker>,
        link: Arc<dyn ControllerLink>,
        files: ResFiles,
        settings: LayerSettings,
    ) -> Self {
        Self {
            adm,
            tracker,
            link,
            files,
            settings,
        }
    }

    pub fn files(&self) -> &ResFiles {
        &self.files
    }

    /// Build the caches of a pass and write every configuration file that can already be
    /// rendered. Resources whose file could not be written are always adjusted.
    pub fn prepare<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a mut DrbdResource>,
    ) -> PassContext {
        let status = match self.adm.status() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("could not capture the DRBD status: {e}");
                None
            }
        };

        let mut minors = BTreeMap::new();
        let mut not_generated = Vec::new();
        for rsc in resources {
            let name = rsc.suffixed_name();
            for vlm in rsc.volumes.values() {
                minors.insert(vlm.minor, name.clone());
            }
            if rsc.is_res_file_ready() && !rsc.flags.is_going_down() {
                if let Err(e) = self.files.regenerate(rsc) {
                    error!("{e}");
                    not_generated.push(name.to_lowercase());
                }
            } else {
                not_generated.push(name.to_lowercase());
            }
        }

        let adjustable = if self.settings.use_adjustable_list {
            match self.adm.list_adjustable(&minors) {
                Ok(mut names) => {
                    names.extend(not_generated);
                    trace!("resources to adjust: {names:?}");
                    Some(names)
                }
                Err(e) => {
                    error!("could not list the adjustable DRBD resources: {e}");
                    None
                }
            }
        } else {
            None
        };

        PassContext { status, adjustable }
    }

    /// Reconcile one resource. Child layers are processed through `children` when DRBD needs
    /// their devices.
    pub fn process_resource(
        &self,
        ctx: &PassContext,
        rsc: &mut DrbdResource,
        children: &mut dyn ChildProcessor,
        report: &mut Report,
    ) -> Result<()> {
        if rsc.rollback_target.is_some() {
            // snapshot rollback: take DRBD down, roll back below, start DRBD again
            self.delete_drbd(rsc, report)?;
            if self.process_child(rsc, children, report)?
                && self.adjust_drbd(ctx, rsc, children, report, true, None)?
            {
                self.files.backup(rsc)?;
            }
        } else if should_delete(rsc) {
            self.delete_drbd(rsc, report)?;
            self.process_child(rsc, children, report)?;
            self.files.delete_backup(rsc)?;
        } else if self.adjust_drbd(ctx, rsc, children, report, false, ctx.status.as_deref())? {
            let msg = format!("Resource '{}' [DRBD] adjusted.", rsc.suffixed_name());
            info!("{msg}");
            report.add(EntryKind::Modified, &rsc.rsc_name, msg, None);
            self.files.backup(rsc)?;
        } else {
            let msg = format!("Resource '{}' [DRBD] not adjusted", rsc.suffixed_name());
            info!("{msg}");
            report.add(
                EntryKind::Info,
                &rsc.rsc_name,
                msg,
                Some("This happened most likely because the layer below did not provide a device to work with."),
            );
        }
        Ok(())
    }

    fn delete_drbd(&self, rsc: &mut DrbdResource, report: &mut Report) -> Result<()> {
        let name = rsc.suffixed_name();
        // INACTIVE resources come through here on every pass; only take down what is up
        sync::update_to_current_state(&self.tracker, rsc)?;
        if rsc.exists {
            trace!("Shutting down drbd resource {name}");
            self.adm.down(&name).map_err(|e| {
                Error::storage(
                    Failure::new(abort_msg(&name))
                        .cause(format!("Shutdown of the DRBD resource '{name}' failed"))
                        .correction("Check whether the DRBD utilities are installed and executable")
                        .with_source(e),
                )
            })?;
            if self.settings.windows {
                self.adm
                    .close_firewall_port(rsc.definition.tcp_port)
                    .map_err(|e| Error::resource_cmd(&name, "Failed to close the DRBD port", e))?;
            }
            let msg = format!("Resource '{name}' [DRBD] deleted.");
            info!("{msg}");
            report.add(EntryKind::Deleted, &rsc.rsc_name, msg, None);
        }

        self.files.delete(rsc)?;
        rsc.mark_nonexistent();
        for vlm in rsc.volumes.values_mut() {
            vlm.device_path = None;
            // the metadata may be wiped before the resource comes back
            vlm.check_metadata = true;
        }
        Ok(())
    }

    /// Hand the data and meta children to `children`. Returns whether DRBD can continue.
    fn process_child(
        &self,
        rsc: &mut DrbdResource,
        children: &mut dyn ChildProcessor,
        report: &mut Report,
    ) -> Result<bool> {
        let diskless = rsc.is_diskless();
        // DRBD_DELETE alone keeps the layers below
        let process = (!diskless || rsc.flags.is_disk_removing())
            && (!rsc.flags.contains(ResourceFlag::DrbdDelete)
                || rsc.flags.contains(ResourceFlag::Delete));
        if !process {
            return Ok(diskless);
        }

        if let Some(child) = rsc.data_child.as_deref_mut() {
            children.process_child(child, report)?;
        }
        if let Some(child) = rsc.meta_child.as_deref_mut() {
            children.process_child(child, report)?;
        }
        rsc.refresh_backing_devices();
        Ok(true)
    }

    /// Detach volumes that are removed, cloned or lose their disk. Returns the volumes whose
    /// metadata has to be checked.
    fn detach_volumes_if_necessary(&self, rsc: &mut DrbdResource) -> Result<Vec<u32>> {
        let mut check_metadata = Vec::new();
        let disk_removing = rsc.flags.is_disk_removing();
        if rsc.is_diskless() && !disk_removing {
            return Ok(check_metadata);
        }

        let name = rsc.suffixed_name();
        for vlm in rsc.volumes.values_mut() {
            let diskless = if vlm.flags.needs_detach() {
                false
            } else if disk_removing {
                true
            } else {
                check_metadata.push(vlm.vlm_nr);
                continue;
            };
            if !vlm.has_disk || vlm.failed {
                continue;
            }

            trace!("Detaching volume {name}/{}", vlm.vlm_nr);
            self.adm.detach(vlm.minor, diskless).map_err(|e| {
                Error::storage(
                    Failure::new(abort_msg(&name))
                        .cause(format!("Failed to detach DRBD volume {name}/{}", vlm.vlm_nr))
                        .with_source(e),
                )
            })?;
            vlm.has_disk = false;
            vlm.exists = false;
        }
        Ok(check_metadata)
    }

    /// Bring the user suspend flag of a running resource in line with the placement.
    fn adjust_suspend_io(&self, rsc: &mut DrbdResource) -> Result<()> {
        let name = rsc.suffixed_name();
        let should_suspend = rsc.exists && rsc.suspend_io;
        if should_suspend && !rsc.suspended {
            trace!("Suspending DRBD I/O for {name}");
            self.adm
                .suspend_io(&name)
                .map_err(|e| Error::resource_cmd(&name, "Failed to suspend I/O", e))?;
            rsc.suspended = true;
        } else if rsc.suspended && !should_suspend {
            trace!("Resuming DRBD I/O for {name}");
            self.adm
                .resume_io(&name)
                .map_err(|e| Error::resource_cmd(&name, "Failed to resume I/O", e))?;
            rsc.suspended = false;
        }
        Ok(())
    }

    /// Create or modify the DRBD resource. Returns whether processing could continue; `false`
    /// means DRBD is waiting on the layers below or on a peer.
    fn adjust_drbd(
        &self,
        ctx: &PassContext,
        rsc: &mut DrbdResource,
        children: &mut dyn ChildProcessor,
        report: &mut Report,
        children_processed: bool,
        status: Option<&str>,
    ) -> Result<bool> {
        let name = rsc.suffixed_name();
        // a rollback just took the resource down, it always has to come back up
        rsc.adjust_required = children_processed || ctx.requires_adjust(&name);
        if !rsc.adjust_required {
            debug!("{name}: no adjust required");
            return Ok(true);
        }
        let adm = self.adm.as_ref();

        if self.settings.windows {
            adm.open_firewall_port(rsc.definition.tcp_port)
                .map_err(|e| Error::resource_cmd(&name, "Failed to open the DRBD port", e))?;
        }

        sync::update_to_current_state(&self.tracker, rsc)?;
        let check_metadata = self.detach_volumes_if_necessary(rsc)?;
        self.adjust_suspend_io(rsc)?;
        resize::shrink_if_necessary(adm, rsc)?;

        let skip_disk = rsc.skip_disk;
        let mut cont = true;
        if !children_processed && !skip_disk {
            cont = self.process_child(rsc, children, report)?;
        }
        if !cont || !resize::resize_allowed(rsc) {
            debug!("{name}: waiting for the layers below or a resizing peer");
            return Ok(false);
        }

        let mut create_metadata = Vec::new();
        if !rsc.is_diskless() && !skip_disk {
            for vlm_nr in check_metadata {
                let Some(vlm) = rsc.volumes.get(&vlm_nr) else {
                    continue;
                };
                if !metadata::has_valid_metadata(adm, &name, vlm)?
                    || metadata::needs_new_metadata(adm, rsc, status)?
                {
                    create_metadata.push(vlm_nr);
                }
            }
        }

        // the children may only now provide their devices; create-md needs the file
        self.files.regenerate(rsc)?;
        for vlm_nr in create_metadata {
            metadata::create(adm, rsc, vlm_nr)?;
        }
        resize::grow_if_necessary(adm, rsc)?;

        peers::cleanup_deleted_peers(adm, &self.tracker, rsc, skip_disk)?;

        let opts = AdjustOptions {
            skip_disk,
            ..AdjustOptions::default()
        };
        if let Err(e) = adm.adjust(&name, opts) {
            self.files.restore(rsc)?;
            return Err(Error::resource_cmd(
                &name,
                format!("Failed to adjust DRBD resource {name}"),
                e,
            ));
        }

        if rsc.flags.is_restore_from_snapshot() && !rsc.definition.force_initial_sync {
            // no peer of the restored data exists; their bitmap slots start over
            let ids = rsc.definition.backup_node_ids_to_reset();
            peers::forget_peers_cleanup(adm, rsc, ids.as_deref())?;
        }
        if !skip_disk {
            peers::recover_after_skip_disk(adm, rsc)?;
        }
        rsc.adjust_required = false;

        for vlm in rsc.volumes.values_mut() {
            if vlm.flags.needs_detach() {
                // adjust just removed it
                vlm.exists = false;
            } else {
                vlm.exists = true;
                vlm.device_path = Some(vlm.generated_device_path());
                vlm.size_state = crate::layer::SizeState::AsExpected;
            }
        }

        promote::cond_initial_or_skip_sync(
            adm,
            &self.tracker,
            self.link.as_ref(),
            rsc,
            self.settings.primary_timeout,
        )?;
        Ok(true)
    }

    /// Announce a processed resource that DRBD knows. DRBD's own event for it may have been
    /// consumed before this node started managing the resource.
    pub fn resource_finished(&self, rsc: &DrbdResource) -> Result<bool> {
        let name = rsc.suffixed_name();
        match self.tracker.get_resource(&name) {
            Ok(Some(_)) => {
                self.link.notify(Notification::ResourceCreated {
                    resource: name,
                    node: rsc.node_name.clone(),
                });
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(Error::NoInitialState) => Err(Error::Implementation(format!(
                "resource '{name}' finished without an initial DRBD state"
            ))),
            Err(e) => Err(e),
        }
    }
}

/// The device has to go: definition down, resource removed or deactivated, or a volume is
/// being cloned.
pub fn should_delete(rsc: &DrbdResource) -> bool {
    rsc.definition.down
        || rsc.flags.is_going_down()
        || rsc.volumes.values().any(|v| v.flags.is_cloning())
}
