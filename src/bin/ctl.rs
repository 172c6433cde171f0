// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use replicad_lib::{
    self,
    commands::{self, Cli},
};

/// The replicad_ctl binary is used to launch admin commands like "validate", "render", etc.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("REPLICAD_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
