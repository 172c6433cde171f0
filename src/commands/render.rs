// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{handled_error, load_cluster, Cli, HandledResult},
    drbd::conf_builder,
};

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Resource name, including a suffix if the resource has one.
    resource: String,
}

/// Print the configuration file as it would be written, taking the configured backing disks at
/// face value.
pub fn render(cli: &Cli, args: &RenderArgs) -> HandledResult<()> {
    let mut cluster = load_cluster(cli)?;
    let local_node = cluster.local_node().to_string();
    let Some(rsc) = cluster.drbd_resource_mut(&args.resource) else {
        eprintln!(
            "Resource '{}' is not deployed on node '{local_node}'.",
            args.resource
        );
        return handled_error();
    };

    for child in [rsc.data_child.as_deref_mut(), rsc.meta_child.as_deref_mut()]
        .into_iter()
        .flatten()
    {
        if let Some(layer) = child.as_child_mut() {
            for vlm in layer.volumes.values_mut() {
                vlm.device_path = vlm.backing_disk.clone();
            }
        }
    }
    rsc.refresh_backing_devices();

    print!("{}", conf_builder::render(rsc));
    Ok(())
}
