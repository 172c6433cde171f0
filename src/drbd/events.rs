// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! events.rs
//!
//! Interprets `drbdsetup events2` lines and applies them to the [`StateTracker`].
//!
//! Every line has the form `<action> <object> key:value ...`. The stream starts with `exists`
//! lines describing the current state, terminated by `exists -`. Changes reported before that
//! marker are queued and applied once the initial state is complete.

use std::{collections::BTreeMap, process::Stdio, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::tracker::{
    ConnectionInfo, ConnectionState, DiskState, ResourceState, Role, StateTracker,
    UnknownStateError, VolumeState,
};
use crate::exec::{self, ExecutionError};

const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Exists,
    Create,
    Change,
    Destroy,
    /// Helper calls and anything else that is not tracked.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Object {
    Resource,
    Connection,
    Device,
    PeerDevice,
    EndOfInitialState,
    /// Paths and anything else that is not tracked.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: Action,
    pub object: Object,
    pub props: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum EventsError {
    #[error("event line without an object type: '{0}'")]
    MissingObject(String),

    #[error("{object} event without '{key}'")]
    MissingKey { object: &'static str, key: &'static str },

    #[error("{object} event for unknown resource '{rsc}'")]
    UnknownResource { object: &'static str, rsc: String },

    #[error("bad value for '{key}': '{value}'")]
    BadValue { key: &'static str, value: String },

    #[error(transparent)]
    UnknownState(#[from] UnknownStateError),
}

/// Parse one line. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Event>, EventsError> {
    let mut tokens = line.split_whitespace();
    let Some(action) = tokens.next() else {
        return Ok(None);
    };
    let Some(object) = tokens.next() else {
        return Err(EventsError::MissingObject(line.to_string()));
    };

    let action = match action {
        "exists" => Action::Exists,
        "create" => Action::Create,
        "change" => Action::Change,
        "destroy" => Action::Destroy,
        _ => Action::Other,
    };
    let object = match object {
        "resource" => Object::Resource,
        "connection" => Object::Connection,
        "device" => Object::Device,
        "peer-device" => Object::PeerDevice,
        "-" => Object::EndOfInitialState,
        _ => Object::Other,
    };
    let props = tokens
        .filter_map(|kv| kv.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(Some(Event {
        action,
        object,
        props,
    }))
}

fn get<'a>(
    props: &'a BTreeMap<String, String>,
    object: &'static str,
    key: &'static str,
) -> Result<&'a str, EventsError> {
    props
        .get(key)
        .map(String::as_str)
        .ok_or(EventsError::MissingKey { object, key })
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, EventsError> {
    value.parse().map_err(|_| EventsError::BadValue {
        key,
        value: value.to_string(),
    })
}

fn yes_no(key: &'static str, value: &str) -> Result<bool, EventsError> {
    match value {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(EventsError::BadValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn update_resource(rsc: &mut ResourceState, props: &BTreeMap<String, String>) -> Result<(), EventsError> {
    if let Some(role) = props.get("role") {
        rsc.role = role.parse::<Role>()?;
    }
    if let Some(suspended) = props.get("suspended") {
        // "no", or a comma separated list of reasons such as "user" or "quorum"
        rsc.suspended_user = Some(suspended.split(',').any(|r| r == "user"));
    }
    if let Some(score) = props.get("promotion_score") {
        rsc.promotion_score = Some(parse_num("promotion_score", score)?);
    }
    if let Some(may_promote) = props.get("may_promote") {
        rsc.may_promote = Some(yes_no("may_promote", may_promote)?);
    }
    Ok(())
}

fn update_volume(vlm: &mut VolumeState, props: &BTreeMap<String, String>) -> Result<(), EventsError> {
    if let Some(minor) = props.get("minor") {
        vlm.minor = Some(parse_num("minor", minor)?);
    }
    if let Some(disk) = props.get("disk") {
        vlm.disk_state = disk.parse::<DiskState>()?;
    }
    if let Some(client) = props.get("client") {
        vlm.client = yes_no("client", client)?;
    }
    Ok(())
}

/// Apply a single event to the tracker.
pub fn apply(tracker: &StateTracker, event: &Event) -> Result<(), EventsError> {
    let props = &event.props;
    match (event.action, event.object) {
        (_, Object::EndOfInitialState) => {
            tracker.initial_state_complete();
            Ok(())
        }
        (Action::Other, _) | (_, Object::Other) | (_, Object::PeerDevice) => Ok(()),

        (Action::Exists | Action::Create | Action::Change, Object::Resource) => {
            let name = get(props, "resource", "name")?;
            tracker.update(None, |resources| {
                let rsc = resources
                    .entry(name.to_string())
                    .or_insert_with(|| ResourceState::new(name));
                update_resource(rsc, props)
            })
        }
        (Action::Destroy, Object::Resource) => {
            let name = get(props, "resource", "name")?;
            tracker.update(Some(name), |resources| resources.remove(name));
            Ok(())
        }

        (action, Object::Connection) => {
            let name = get(props, "connection", "name")?;
            let peer = get(props, "connection", "conn-name")?;
            tracker.update(None, |resources| {
                let rsc = resources
                    .get_mut(name)
                    .ok_or_else(|| EventsError::UnknownResource {
                        object: "connection",
                        rsc: name.to_string(),
                    })?;
                if action == Action::Destroy {
                    rsc.connections.remove(peer);
                    return Ok(());
                }
                let conn = rsc
                    .connections
                    .entry(peer.to_string())
                    .or_insert(ConnectionInfo {
                        peer_node_id: None,
                        role: Role::Unknown,
                        state: ConnectionState::Unknown,
                    });
                if let Some(id) = props.get("peer-node-id") {
                    conn.peer_node_id = Some(parse_num("peer-node-id", id)?);
                }
                if let Some(state) = props.get("connection") {
                    conn.state = state.parse::<ConnectionState>()?;
                }
                if let Some(role) = props.get("role") {
                    conn.role = role.parse::<Role>()?;
                }
                Ok(())
            })
        }

        (action, Object::Device) => {
            let name = get(props, "device", "name")?;
            let vlm_nr: u32 = parse_num("volume", get(props, "device", "volume")?)?;
            let disk_changed = props.contains_key("disk") || action == Action::Destroy;
            tracker.update(disk_changed.then_some(name), |resources| {
                let rsc = resources
                    .get_mut(name)
                    .ok_or_else(|| EventsError::UnknownResource {
                        object: "device",
                        rsc: name.to_string(),
                    })?;
                if action == Action::Destroy {
                    rsc.volumes.remove(&vlm_nr);
                    return Ok(());
                }
                let vlm = rsc.volumes.entry(vlm_nr).or_insert(VolumeState {
                    minor: None,
                    disk_state: DiskState::Unknown,
                    client: false,
                });
                update_volume(vlm, props)
            })
        }
    }
}

/// Feeds events into a tracker, holding back changes until the initial state is complete.
#[derive(Debug)]
pub struct EventsMonitor {
    tracker: Arc<StateTracker>,
    exists_finished: bool,
    during_exists: Vec<Event>,
}

impl EventsMonitor {
    pub fn new(tracker: Arc<StateTracker>) -> Self {
        Self {
            tracker,
            exists_finished: false,
            during_exists: Vec::new(),
        }
    }

    pub fn receive_line(&mut self, line: &str) -> Result<(), EventsError> {
        trace!("DRBD 'events2': {line}");
        let Some(event) = parse_line(line)? else {
            return Ok(());
        };

        if !self.exists_finished && event.action != Action::Exists {
            self.during_exists.push(event);
            return Ok(());
        }

        apply(&self.tracker, &event)?;

        if event.object == Object::EndOfInitialState && !self.exists_finished {
            self.exists_finished = true;
            for queued in std::mem::take(&mut self.during_exists) {
                if let Err(e) = apply(&self.tracker, &queued) {
                    warn!("dropping queued DRBD event: {e}");
                }
            }
        }
        Ok(())
    }

    /// The event source went away. The next source starts with a fresh initial state.
    pub fn reinitializing(&mut self) {
        self.exists_finished = false;
        self.during_exists.clear();
        self.tracker.reinitializing();
    }
}

/// Take a one-shot snapshot of the current DRBD state, as used by single pass runs.
pub fn snapshot_now(tracker: Arc<StateTracker>, command: &[String]) -> Result<(), ExecutionError> {
    let Some((program, args)) = command.split_first() else {
        return Err(ExecutionError::ParseFailure {
            command: String::new(),
            reason: "empty events command".to_string(),
        });
    };
    let now = "--now".to_string();
    let output = exec::execute_args(program, args.iter().chain(std::iter::once(&now)))?;
    let mut monitor = EventsMonitor::new(tracker);
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Err(e) = monitor.receive_line(line) {
            warn!("ignoring DRBD event line '{line}': {e}");
        }
    }
    Ok(())
}

/// Keep a `drbdsetup events2` process running and feed its output into the tracker. Restarts
/// the process whenever it exits.
pub async fn monitor(tracker: Arc<StateTracker>, command: Vec<String>) {
    let Some((program, args)) = command.split_first() else {
        error!("no DRBD events command configured");
        return;
    };
    let mut monitor = EventsMonitor::new(tracker);

    loop {
        info!("starting DRBD events source '{}'", command.join(" "));
        match tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    let mut lines = BufReader::new(stdout).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => {
                                if let Err(e) = monitor.receive_line(&line) {
                                    warn!("ignoring DRBD event line '{line}': {e}");
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("failed reading DRBD events: {e}");
                                break;
                            }
                        }
                    }
                }
                match child.wait().await {
                    Ok(status) => warn!("DRBD events source exited: {status}"),
                    Err(e) => warn!("DRBD events source failed: {e}"),
                }
            }
            Err(e) => error!("could not start DRBD events source: {e}"),
        }

        monitor.reinitializing();
        debug!("restarting DRBD events source in {RESTART_DELAY:?}");
        tokio::time::sleep(RESTART_DELAY).await;
    }
}
