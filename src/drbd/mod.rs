// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The DRBD device layer: everything needed to drive the kernel's DRBD state towards the
//! declared layer data.

pub mod adm;
pub mod conf_builder;
pub mod conf_file;
pub mod events;
pub mod layer;
pub mod metadata;
pub mod peers;
pub mod promote;
pub mod resize;
pub mod sync;
pub mod tracker;

pub use layer::{DrbdLayer, PassContext};
