// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use replicad_lib::{self, cluster, manager};

/// The replicad binary runs the DRBD reconciliation daemon.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("REPLICAD_LOG", "info"))
        .init();

    let args = manager::Cli::parse();

    let Ok(cluster) = cluster::Cluster::new(args.config.as_deref()) else {
        std::process::exit(1);
    };

    if manager::main(cluster, &args).is_err() {
        std::process::exit(1);
    }
}
