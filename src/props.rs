// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! props.rs
//!
//! Namespaced view onto the persisted satellite properties.

use std::sync::Arc;

use crate::state::{State, StateError};

/// Set on the resource definition once any node became primary for the initial sync.
pub const PROP_PRIMARY_SET: &str = "DrbdPrimarySetOn";

/// Peer node ids whose `forget-peer` was deferred while the disk was skipped.
pub const KEY_DRBD_NODE_IDS_TO_RESET: &str = "Satellite/Drbd/NodeIdsToReset";

/// Peer node ids recorded on the resource definition when a backup was taken.
pub const KEY_BACKUP_NODE_IDS_TO_RESET: &str = "BackupShipping/BackupNodeIdsToReset";

pub const NODE_ID_SEPARATOR: char = ',';

#[derive(Debug, Clone)]
pub struct Props {
    namespace: String,
    store: Arc<State>,
}

impl Props {
    pub fn new(store: Arc<State>, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            store,
        }
    }

    /// Properties that are neither persisted nor shared with anything else.
    pub fn detached() -> Self {
        Self::new(Arc::new(State::in_memory()), "")
    }

    fn full_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.namespace)
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(&self.full_key(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.store.set(&self.full_key(key), value)
    }

    pub fn remove(&self, key: &str) -> Result<(), StateError> {
        self.store.remove(&self.full_key(key))
    }

    /// Append `id` to a separator delimited list stored under `key`.
    pub fn append_to_list(&self, key: &str, id: &str) -> Result<(), StateError> {
        let value = match self.get(key) {
            Some(old) if !old.trim().is_empty() => format!("{old}{NODE_ID_SEPARATOR}{id}"),
            _ => id.to_string(),
        };
        self.set(key, &value)
    }
}

/// Split a stored node id list, skipping blanks and anything that is not a number.
pub fn parse_node_ids(ids: &str) -> Vec<u32> {
    ids.split(NODE_ID_SEPARATOR)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter_map(|id| id.parse().ok())
        .collect()
}
