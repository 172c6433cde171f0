// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! controller.rs
//!
//! One-way notifications from this node to the central controller.

use std::{
    io::Write,
    os::unix::net::UnixStream,
    sync::Mutex,
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Ask the controller to make this node primary for the initial sync. Sent even when the
    /// data is already initialized so the controller records that a primary was chosen.
    RequestPrimary {
        resource: String,
        node: String,
        already_initialized: bool,
    },
    /// The resource finished processing and DRBD knows it.
    ResourceCreated { resource: String, node: String },
}

pub trait ControllerLink: Send + Sync {
    /// Fire and forget. Delivery problems are logged, never returned.
    fn notify(&self, msg: Notification);
}

/// Writes one JSON object per line to the controller's unix socket.
#[derive(Debug)]
pub struct SocketLink {
    path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl SocketLink {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            stream: Mutex::new(None),
        }
    }

    fn send(&self, line: &str) -> std::io::Result<()> {
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if stream.is_none() {
            let s = UnixStream::connect(&self.path)?;
            s.set_write_timeout(Some(SEND_TIMEOUT))?;
            *stream = Some(s);
        }
        let result = match stream.as_mut() {
            Some(s) => s
                .write_all(line.as_bytes())
                .and_then(|()| s.write_all(b"\n")),
            None => Ok(()),
        };
        if result.is_err() {
            // reconnect on the next message
            *stream = None;
        }
        result
    }
}

impl ControllerLink for SocketLink {
    fn notify(&self, msg: Notification) {
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(e) => {
                warn!("could not serialize controller notification {msg:?}: {e}");
                return;
            }
        };
        if let Err(e) = self.send(&line) {
            warn!("controller at '{}' unreachable, dropping {line}: {e}", self.path);
        }
    }
}

/// Used when no controller socket is configured.
#[derive(Debug, Default)]
pub struct LogLink;

impl ControllerLink for LogLink {
    fn notify(&self, msg: Notification) {
        info!("controller notification: {msg:?}");
    }
}
