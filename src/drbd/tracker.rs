// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! tracker.rs
//!
//! Eventually consistent mirror of the kernel's DRBD state, fed from `drbdsetup events2`.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{mpsc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    Unknown,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Diskless,
    Attaching,
    Detaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    Unknown,
    Consistent,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStateError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownStateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownStateError {}

fn unknown(kind: &'static str, value: &str) -> UnknownStateError {
    UnknownStateError {
        kind,
        value: value.to_string(),
    }
}

impl FromStr for Role {
    type Err = UnknownStateError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Primary" => Role::Primary,
            "Secondary" => Role::Secondary,
            "Unknown" => Role::Unknown,
            _ => return Err(unknown("role", s)),
        })
    }
}

impl FromStr for ConnectionState {
    type Err = UnknownStateError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "StandAlone" => ConnectionState::StandAlone,
            "Disconnecting" => ConnectionState::Disconnecting,
            "Unconnected" => ConnectionState::Unconnected,
            "Timeout" => ConnectionState::Timeout,
            "BrokenPipe" => ConnectionState::BrokenPipe,
            "NetworkFailure" => ConnectionState::NetworkFailure,
            "ProtocolError" => ConnectionState::ProtocolError,
            "TearDown" => ConnectionState::TearDown,
            "Unknown" => ConnectionState::Unknown,
            "Connecting" => ConnectionState::Connecting,
            "Connected" => ConnectionState::Connected,
            _ => return Err(unknown("connection state", s)),
        })
    }
}

impl FromStr for DiskState {
    type Err = UnknownStateError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Diskless" => DiskState::Diskless,
            "Attaching" => DiskState::Attaching,
            "Detaching" => DiskState::Detaching,
            "Failed" => DiskState::Failed,
            "Negotiating" => DiskState::Negotiating,
            "Inconsistent" => DiskState::Inconsistent,
            "Outdated" => DiskState::Outdated,
            "DUnknown" | "Unknown" => DiskState::Unknown,
            "Consistent" => DiskState::Consistent,
            "UpToDate" => DiskState::UpToDate,
            _ => return Err(unknown("disk state", s)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_node_id: Option<u32>,
    /// The peer's role as this node sees it.
    pub role: Role,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeState {
    pub minor: Option<u32>,
    pub disk_state: DiskState,
    /// Intentionally diskless.
    pub client: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub name: String,
    pub role: Role,
    pub suspended_user: Option<bool>,
    pub promotion_score: Option<i32>,
    pub may_promote: Option<bool>,
    /// Keyed by the peer's node name.
    pub connections: BTreeMap<String, ConnectionInfo>,
    pub volumes: BTreeMap<u32, VolumeState>,
}

impl ResourceState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: Role::Unknown,
            suspended_user: None,
            promotion_score: None,
            may_promote: None,
            connections: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    pub fn connection(&self, node_name: &str) -> Option<&ConnectionInfo> {
        self.connections.get(node_name)
    }

    /// Every volume has data DRBD could promote with, or is an intentional client.
    pub fn has_valid_state_for_primary(&self) -> bool {
        self.volumes.values().all(|vlm| match vlm.disk_state {
            DiskState::Inconsistent
            | DiskState::Outdated
            | DiskState::Consistent
            | DiskState::UpToDate => true,
            DiskState::Diskless => vlm.client,
            DiskState::Attaching
            | DiskState::Detaching
            | DiskState::Failed
            | DiskState::Negotiating
            | DiskState::Unknown => false,
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    initial_state: bool,
    resources: BTreeMap<String, ResourceState>,
    observers: Vec<(u64, String, mpsc::Sender<()>)>,
    next_observer_id: u64,
}

#[derive(Debug, Default)]
pub struct StateTracker {
    inner: Mutex<Inner>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_initial_state(&self) -> bool {
        self.lock().initial_state
    }

    /// Snapshot of one resource. `Ok(None)` means DRBD does not know the resource.
    pub fn get_resource(&self, name: &str) -> Result<Option<ResourceState>> {
        let inner = self.lock();
        if !inner.initial_state {
            return Err(Error::NoInitialState);
        }
        Ok(inner.resources.get(name).cloned())
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.lock().resources.keys().cloned().collect()
    }

    /// The event source restarted; everything known so far is stale.
    pub fn reinitializing(&self) {
        let mut inner = self.lock();
        inner.initial_state = false;
        inner.resources.clear();
        debug!("DRBD state tracker reinitializing");
    }

    pub fn initial_state_complete(&self) {
        self.lock().initial_state = true;
        debug!("DRBD state tracker received the initial state");
    }

    /// Run `f` on the tracked resources. Disk observers of `notify_rsc` are woken afterwards.
    pub(crate) fn update<T>(
        &self,
        notify_rsc: Option<&str>,
        f: impl FnOnce(&mut BTreeMap<String, ResourceState>) -> T,
    ) -> T {
        let mut inner = self.lock();
        let ret = f(&mut inner.resources);
        if let Some(rsc) = notify_rsc {
            for (_, _, tx) in inner.observers.iter().filter(|(_, name, _)| name == rsc) {
                // A full channel or a waiter that already gave up are both fine.
                let _ = tx.send(());
            }
        }
        ret
    }

    /// Register for disk state changes of `rsc`. The registration lives as long as the
    /// returned observer.
    pub fn observe_disk(&self, rsc: &str) -> DiskObserver<'_> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        let id = inner.next_observer_id;
        inner.next_observer_id += 1;
        inner.observers.push((id, rsc.to_string(), tx));
        trace!("registered disk observer {id} for '{rsc}'");
        DiskObserver {
            tracker: self,
            id,
            rx,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    fn remove_observer(&self, id: u64) {
        self.lock().observers.retain(|(oid, _, _)| *oid != id);
        trace!("removed disk observer {id}");
    }
}

pub struct DiskObserver<'a> {
    tracker: &'a StateTracker,
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl DiskObserver<'_> {
    /// Block until a disk state change was reported or `timeout` elapsed. Returns whether a
    /// change was seen.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for DiskObserver<'_> {
    fn drop(&mut self) {
        self.tracker.remove_observer(self.id);
    }
}
