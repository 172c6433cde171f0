// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! devmgr.rs
//!
//! One device manager pass over the layer stacks of the local node.

use std::path::Path;

use log::{debug, error, info};

use crate::{
    drbd::{layer::should_delete, DrbdLayer},
    error::{Error, Result},
    layer::{ChildProcessor, DrbdResource, LayerData},
    report::{EntryKind, Report},
};

/// The storage layer beneath DRBD. The volumes are provisioned outside of this daemon, so
/// processing only hands out the backing disks that exist.
#[derive(Debug, Default)]
pub struct StorageHandler;

impl ChildProcessor for StorageHandler {
    fn process_child(&mut self, child: &mut LayerData, _report: &mut Report) -> Result<()> {
        let name = child.suffixed_name();
        let Some(layer) = child.as_child_mut() else {
            return Err(Error::Implementation(format!(
                "DRBD resource '{name}' stacked beneath another DRBD resource"
            )));
        };
        for (vlm_nr, vlm) in layer.volumes.iter_mut() {
            vlm.device_path = vlm
                .backing_disk
                .clone()
                .filter(|disk| Path::new(disk).exists());
            if vlm.device_path.is_none() {
                debug!("{name}/{vlm_nr}: backing disk {:?} not available", vlm.backing_disk);
            }
        }
        Ok(())
    }
}

pub struct DeviceManager<C: ChildProcessor> {
    layer: DrbdLayer,
    children: C,
}

impl<C: ChildProcessor> DeviceManager<C> {
    pub fn new(layer: DrbdLayer, children: C) -> Self {
        Self { layer, children }
    }

    pub fn layer(&self) -> &DrbdLayer {
        &self.layer
    }

    /// Reconcile every DRBD resource in `resources`.
    ///
    /// A failure of one resource is recorded in the report and does not stop the others. An
    /// implementation error aborts the pass.
    pub fn run_pass(&mut self, resources: &mut [LayerData]) -> Result<Report> {
        let mut report = Report::new();
        let ctx = self.layer.prepare(drbd_roots(resources));

        for data in resources.iter_mut() {
            let LayerData::Drbd(rsc) = data else {
                continue;
            };
            let rsc: &mut DrbdResource = rsc;
            match self.process(&ctx, rsc, &mut report) {
                Ok(()) => {}
                Err(e) if e.is_implementation() => {
                    error!("aborting device manager pass: {e}");
                    return Err(e);
                }
                Err(e) => {
                    error!("{e}");
                    let cause = e.failure().and_then(|f| f.cause.clone());
                    report.add(EntryKind::Error, &rsc.rsc_name, e.to_string(), cause.as_deref());
                }
            }
        }

        info!(
            "device manager pass finished: {} entries, errors: {}",
            report.entries().len(),
            report.has_errors()
        );
        Ok(report)
    }

    fn process(
        &mut self,
        ctx: &crate::drbd::PassContext,
        rsc: &mut DrbdResource,
        report: &mut Report,
    ) -> Result<()> {
        self.layer
            .process_resource(ctx, rsc, &mut self.children, report)?;
        if !should_delete(rsc) && rsc.rollback_target.is_none() {
            self.layer.resource_finished(rsc)?;
        }
        Ok(())
    }
}

fn drbd_roots(resources: &mut [LayerData]) -> impl Iterator<Item = &mut DrbdResource> {
    resources.iter_mut().filter_map(|r| match r {
        LayerData::Drbd(rsc) => Some(rsc.as_mut()),
        _ => None,
    })
}
