// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Helpers shared by the unit tests and the integration tests under `tests/`: a private working
//! directory per test, a scripted stand-in for the DRBD utilities, and builders for layer data.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use crate::{
    controller::{ControllerLink, Notification},
    drbd::{
        adm::{ActivityLog, AdjustOptions, DrbdAdm, MdFlavor, SetGi},
        conf_file::ResFiles,
        tracker::StateTracker,
        DrbdLayer,
    },
    error::Result,
    exec::{CommandFailureInfo, ExecutionError},
    flags::{DrbdRscFlags, ResourceFlags},
    layer::{
        ChildLayer, ChildProcessor, ChildVolume, DrbdResource, DrbdVolume, LayerData, NodeId,
        PeerResource, PeerVolume, ResourceDefinitionLayer, VolumeDefinition,
    },
    props::Props,
    report::Report,
};

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
pub fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

trait IgnoreEexist {
    fn ignore_eexist(self) -> Self;
}

impl IgnoreEexist for io::Result<()> {
    fn ignore_eexist(self) -> Self {
        match self {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A TestEnvironment holds a "private" working directory in which the resource files, their
/// backups and the statefile of a test are stored.
///
/// All access to the test's state on the filesystem should be done via methods on TestEnvironment
/// rather than coded in the tests themselves.
pub struct TestEnvironment {
    /// The path to this test's private working directory.
    private_dir_path: String,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// Creates a specific unique subdirectory for the test, emptied out first so that files from
    /// a previous test run don't impact this run.
    pub fn new(test_id: String) -> Self {
        let private_dir_path = test_path(&format!("test_output/{test_id}"));
        match std::fs::remove_dir_all(&private_dir_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };

        std::fs::create_dir_all(test_path("test_output"))
            .ignore_eexist()
            .unwrap();
        std::fs::create_dir(&private_dir_path).unwrap();

        Self { private_dir_path }
    }

    pub fn private_dir(&self) -> &str {
        &self.private_dir_path
    }

    pub fn path(&self, name: &str) -> String {
        format!("{}/{name}", self.private_dir_path)
    }

    /// Resource files live in `res/`, their backups in `res/backup/`.
    pub fn res_files(&self) -> ResFiles {
        let files = ResFiles::new(self.path("res"), self.path("res/backup"));
        files.ensure_dirs().unwrap();
        files
    }

    pub fn statefile_path(&self) -> String {
        self.path("replicad.state")
    }

    /// A DRBD layer working on this environment's resource files.
    pub fn layer(
        &self,
        adm: Arc<FakeAdm>,
        tracker: Arc<StateTracker>,
        link: Arc<RecordingLink>,
    ) -> DrbdLayer {
        DrbdLayer::new(
            adm,
            tracker,
            link,
            self.res_files(),
            crate::drbd::layer::LayerSettings {
                use_adjustable_list: true,
                primary_timeout: std::time::Duration::from_millis(200),
                windows: false,
            },
        )
    }
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    failures: Vec<String>,
    signatures: BTreeMap<String, bool>,
    readable: BTreeMap<String, bool>,
    gids: BTreeMap<String, String>,
    sizes: BTreeMap<u32, u64>,
    adjustable: Option<Vec<String>>,
    status: String,
    up: BTreeSet<String>,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Records every DRBD operation as a short command line and fails the ones whose record starts
/// with a prefix registered through [`FakeAdm::fail`].
#[derive(Default)]
pub struct FakeAdm {
    state: Mutex<FakeState>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl FakeAdm {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) -> std::result::Result<(), ExecutionError> {
        let fails = {
            let mut state = self.lock();
            state.calls.push(call.clone());
            state.failures.iter().any(|prefix| call.starts_with(prefix))
        };
        let hooks: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| call.starts_with(prefix))
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        if fails {
            return Err(ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
                command: call,
                exit_code: Some(10),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            })));
        }
        hooks.iter().for_each(|hook| hook());
        Ok(())
    }

    /// Run `hook` after every successful call starting with `prefix`, e.g. to let DRBD react to
    /// an adjust.
    pub fn on_call(&self, prefix: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((prefix.to_string(), Arc::new(hook)));
    }

    pub fn fail(&self, prefix: &str) {
        self.lock().failures.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn set_signature(&self, md_path: &str, present: bool) {
        self.lock().signatures.insert(md_path.to_string(), present);
    }

    pub fn set_metadata_readable(&self, md_path: &str, readable: bool) {
        self.lock().readable.insert(md_path.to_string(), readable);
    }

    pub fn set_gid(&self, md_path: &str, gids: &str) {
        self.lock().gids.insert(md_path.to_string(), gids.to_string());
    }

    pub fn set_size_sectors(&self, minor: u32, sectors: u64) {
        self.lock().sizes.insert(minor, sectors);
    }

    /// `None` reports every known resource as adjustable.
    pub fn set_adjustable(&self, names: Option<Vec<String>>) {
        self.lock().adjustable = names;
    }

    pub fn set_status(&self, status: &str) {
        self.lock().status = status.to_string();
    }

    pub fn set_up(&self, rsc: &str, up: bool) {
        let mut state = self.lock();
        if up {
            state.up.insert(rsc.to_string());
        } else {
            state.up.remove(rsc);
        }
    }
}

type ExecResult<T> = std::result::Result<T, ExecutionError>;

impl DrbdAdm for FakeAdm {
    fn down(&self, rsc: &str) -> ExecResult<()> {
        self.record(format!("down {rsc}"))
    }

    fn adjust(&self, rsc: &str, opts: AdjustOptions) -> ExecResult<()> {
        let mut call = format!("adjust {rsc}");
        if opts.discard_my_data {
            call.push_str(" --discard-my-data");
        }
        if opts.skip_net {
            call.push_str(" --skip-net");
        }
        if opts.skip_disk {
            call.push_str(" --skip-disk");
        }
        self.record(call)
    }

    fn resize(
        &self,
        rsc: &str,
        vlm_nr: u32,
        assume_clean: bool,
        size_kib: Option<u64>,
    ) -> ExecResult<()> {
        let mut call = format!("resize {rsc}/{vlm_nr}");
        if assume_clean {
            call.push_str(" assume-clean");
        }
        if let Some(size) = size_kib {
            call.push_str(&format!(" size={size}"));
        }
        self.record(call)
    }

    fn detach(&self, minor: u32, diskless: bool) -> ExecResult<()> {
        let suffix = if diskless { " --diskless" } else { "" };
        self.record(format!("detach {minor}{suffix}"))
    }

    fn create_md(
        &self,
        rsc: &str,
        vlm_nr: u32,
        peer_slots: u16,
        al: ActivityLog,
    ) -> ExecResult<()> {
        let mut call = format!("create-md {rsc}/{vlm_nr} {peer_slots}");
        if !al.is_default() {
            call.push_str(&format!(" al={}x{}", al.stripes, al.stripe_size_kib));
        }
        self.record(call)
    }

    fn set_gi(&self, args: &SetGi) -> ExecResult<()> {
        self.record(format!(
            "set-gi {} {} {} {}",
            args.node_id,
            args.minor,
            args.md_path,
            args.gi_data()
        ))
    }

    fn delete_peer(&self, rsc: &str, node_id: u32) -> ExecResult<()> {
        self.record(format!("del-peer {rsc} {node_id}"))
    }

    fn forget_peer(&self, rsc: &str, node_id: u32) -> ExecResult<()> {
        self.record(format!("forget-peer {rsc} {node_id}"))
    }

    fn has_metadata(&self, md_path: &str, _minor: u32, _flavor: MdFlavor) -> ExecResult<bool> {
        self.record(format!("check-md {md_path}"))?;
        Ok(*self.lock().readable.get(md_path).unwrap_or(&true))
    }

    fn current_gid(&self, md_path: &str, _minor: u32, _flavor: MdFlavor) -> ExecResult<String> {
        self.record(format!("get-gi {md_path}"))?;
        Ok(self
            .lock()
            .gids
            .get(md_path)
            .cloned()
            .unwrap_or_else(|| "0000000000000004:0:0:0\n".to_string()))
    }

    fn status(&self) -> ExecResult<String> {
        self.record("status".to_string())?;
        Ok(self.lock().status.clone())
    }

    fn status_resource_up(&self, rsc: &str) -> ExecResult<bool> {
        self.record(format!("status {rsc}"))?;
        Ok(self.lock().up.contains(rsc))
    }

    fn list_adjustable(&self, minors: &BTreeMap<u32, String>) -> ExecResult<Vec<String>> {
        self.record("list-adjustable".to_string())?;
        Ok(match &self.lock().adjustable {
            Some(names) => names.clone(),
            None => minors.values().map(|n| n.to_lowercase()).collect(),
        })
    }

    fn primary(&self, rsc: &str, force: bool) -> ExecResult<()> {
        let suffix = if force { " --force" } else { "" };
        self.record(format!("primary {rsc}{suffix}"))
    }

    fn secondary(&self, rsc: &str) -> ExecResult<()> {
        self.record(format!("secondary {rsc}"))
    }

    fn suspend_io(&self, rsc: &str) -> ExecResult<()> {
        self.record(format!("suspend-io {rsc}"))
    }

    fn resume_io(&self, rsc: &str) -> ExecResult<()> {
        self.record(format!("resume-io {rsc}"))
    }

    fn size_in_sectors(&self, minor: u32) -> ExecResult<u64> {
        self.record(format!("size {minor}"))?;
        self.lock()
            .sizes
            .get(&minor)
            .copied()
            .ok_or_else(|| ExecutionError::ParseFailure {
                command: format!("size {minor}"),
                reason: "no such device".to_string(),
            })
    }

    fn has_md_signature(&self, md_path: &str, _external: bool) -> io::Result<bool> {
        self.record(format!("md-signature {md_path}"))
            .map_err(io::Error::other)?;
        Ok(*self.lock().signatures.get(md_path).unwrap_or(&false))
    }

    fn make_filesystem(&self, device: &str, fs_type: &str) -> ExecResult<()> {
        self.record(format!("mkfs.{fs_type} {device}"))
    }

    fn open_firewall_port(&self, port: u16) -> ExecResult<()> {
        self.record(format!("open-port {port}"))
    }

    fn close_firewall_port(&self, port: u16) -> ExecResult<()> {
        self.record(format!("close-port {port}"))
    }
}

/// Keeps every controller notification for inspection.
#[derive(Debug, Default)]
pub struct RecordingLink {
    messages: Mutex<Vec<Notification>>,
}

impl RecordingLink {
    pub fn messages(&self) -> Vec<Notification> {
        self.messages.lock().unwrap().clone()
    }
}

impl ControllerLink for RecordingLink {
    fn notify(&self, msg: Notification) {
        self.messages.lock().unwrap().push(msg);
    }
}

/// Stands in for the layers beneath DRBD. Processing a child hands out its backing disk as
/// the device, unless devices are withheld.
#[derive(Debug, Default)]
pub struct FakeChildProcessor {
    pub processed: Vec<String>,
    pub withhold_devices: bool,
}

impl ChildProcessor for FakeChildProcessor {
    fn process_child(&mut self, child: &mut LayerData, _report: &mut Report) -> Result<()> {
        self.processed.push(child.suffixed_name());
        let withhold = self.withhold_devices;
        if let Some(layer) = child.as_child_mut() {
            for vlm in layer.volumes.values_mut() {
                vlm.device_path = if withhold {
                    None
                } else {
                    vlm.backing_disk.clone()
                };
            }
        }
        Ok(())
    }
}

pub fn data_device(name: &str, vlm_nr: u32) -> String {
    format!("/dev/vg/{name}_{vlm_nr:05}")
}

fn node_address(node_id: u32) -> IpAddr {
    IpAddr::from([10, 0, 0, (node_id + 1) as u8])
}

/// A resource on node "alpha" (node id 0) with a storage child providing one logical volume per
/// volume number.
pub fn drbd_resource(name: &str, vlm_nrs: &[u32]) -> DrbdResource {
    drbd_resource_with(name, vlm_nrs, |_| {})
}

/// Like [`drbd_resource`], with a chance to change the resource definition first.
pub fn drbd_resource_with(
    name: &str,
    vlm_nrs: &[u32],
    f: impl FnOnce(&mut ResourceDefinitionLayer),
) -> DrbdResource {
    let mut definition = ResourceDefinitionLayer {
        name: name.to_string(),
        peer_slots: 7,
        al_stripes: 1,
        al_stripe_size_kib: 32,
        transport: "tcp".to_string(),
        protocol: "C".to_string(),
        tcp_port: 7000,
        secret: None,
        down: false,
        force_initial_sync: false,
        volumes: vlm_nrs
            .iter()
            .map(|&vlm_nr| {
                (
                    vlm_nr,
                    VolumeDefinition {
                        vlm_nr,
                        minor: 1000 + vlm_nr,
                        size_kib: 1024 * 1024,
                        current_gi: None,
                        fs_type: None,
                    },
                )
            })
            .collect(),
        props: Props::detached(),
    };
    f(&mut definition);

    let volumes = definition
        .volumes
        .values()
        .map(|def| {
            let mut vlm = DrbdVolume::new(def.vlm_nr, def.minor, def.size_kib);
            vlm.data_device = Some(data_device(name, def.vlm_nr));
            (def.vlm_nr, vlm)
        })
        .collect();
    let data_child = LayerData::Storage(ChildLayer {
        suffixed_name: name.to_string(),
        volumes: definition
            .volumes
            .keys()
            .map(|&vlm_nr| {
                let disk = data_device(name, vlm_nr);
                (
                    vlm_nr,
                    ChildVolume {
                        device_path: Some(disk.clone()),
                        backing_disk: Some(disk),
                        thin: false,
                    },
                )
            })
            .collect(),
    });

    DrbdResource {
        node_name: "alpha".to_string(),
        node_id: NodeId(0),
        address: node_address(0),
        rsc_name: name.to_string(),
        suffix: String::new(),
        flags: ResourceFlags::empty(),
        drbd_flags: DrbdRscFlags::empty(),
        peer_slots: definition.peer_slots,
        definition: Arc::new(definition),
        volumes,
        peers: Vec::new(),
        props: Props::detached(),
        skip_disk: false,
        create_primary: false,
        suspend_io: false,
        rollback_target: None,
        data_child: Some(Box::new(data_child)),
        meta_child: None,
        exists: false,
        adjust_required: false,
        primary: false,
        suspended: false,
        res_file_exists: false,
        promotion_score: None,
        may_promote: None,
    }
}

/// A peer with volume 0 at 10.0.0.<node_id + 1>.
pub fn peer(name: &str, node_id: u32) -> PeerResource {
    PeerResource {
        node_name: name.to_string(),
        node_id: NodeId(node_id),
        address: node_address(node_id),
        flags: ResourceFlags::empty(),
        volumes: BTreeMap::from([(0, PeerVolume::default())]),
    }
}

/// Apply `lines` of `drbdsetup events2` output to a tracker that already has its initial state.
pub fn feed_events(tracker: &StateTracker, lines: &[&str]) {
    for line in lines {
        if let Some(event) = crate::drbd::events::parse_line(line).unwrap() {
            crate::drbd::events::apply(tracker, &event).unwrap();
        }
    }
}

/// Feed `lines` of `drbdsetup events2` output into a fresh tracker.
pub fn tracker_from_events(lines: &[&str]) -> Arc<StateTracker> {
    let tracker = Arc::new(StateTracker::new());
    let mut monitor = crate::drbd::events::EventsMonitor::new(Arc::clone(&tracker));
    for line in lines {
        monitor.receive_line(line).unwrap();
    }
    tracker
}
