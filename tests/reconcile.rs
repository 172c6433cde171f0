// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use replicad_lib::{
        cluster::Cluster,
        config::Config,
        controller::Notification,
        devmgr::DeviceManager,
        drbd::tracker::StateTracker,
        flags::{ResourceFlag, VolumeFlag},
        layer::{DrbdResource, LayerData, SizeState},
        props::{KEY_DRBD_NODE_IDS_TO_RESET, PROP_PRIMARY_SET},
        report::{EntryKind, Report},
        state::State,
        test_env::*,
    };

    const UP_TO_DATE: [&str; 3] = [
        "exists resource name:r0 role:Secondary",
        "exists device name:r0 volume:0 minor:1000 disk:UpToDate client:no",
        "exists -",
    ];

    struct Harness {
        adm: Arc<FakeAdm>,
        link: Arc<RecordingLink>,
        manager: DeviceManager<FakeChildProcessor>,
    }

    impl Harness {
        fn new(env: &TestEnvironment, tracker: Arc<StateTracker>) -> Self {
            let adm = Arc::new(FakeAdm::new());
            let link = Arc::new(RecordingLink::default());
            let layer = env.layer(Arc::clone(&adm), tracker, Arc::clone(&link));
            Self {
                adm,
                link,
                manager: DeviceManager::new(layer, FakeChildProcessor::default()),
            }
        }

        fn pass(&mut self, resources: &mut [LayerData]) -> Report {
            self.manager.run_pass(resources).unwrap()
        }

        fn position(&self, call: &str) -> usize {
            let calls = self.adm.calls();
            calls
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("'{call}' was not called: {calls:?}"))
        }
    }

    fn drbd(resources: &[LayerData]) -> &DrbdResource {
        match &resources[0] {
            LayerData::Drbd(rsc) => rsc,
            other => panic!("not a DRBD resource: {other:?}"),
        }
    }

    fn primary_set(rsc_name: &str, vlm_nrs: &[u32]) -> DrbdResource {
        drbd_resource_with(rsc_name, vlm_nrs, |def| {
            def.props.set(PROP_PRIMARY_SET, "alpha").unwrap();
        })
    }

    #[test]
    fn second_pass_without_changes_does_nothing() {
        let env = TestEnvironment::new("reconcile_idempotent".to_string());
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        let mut resources = vec![LayerData::Drbd(Box::new(primary_set("r0", &[0])))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("adjust r0"), 1);
        assert!(env.res_files().res_file("r0").exists());
        assert!(env.res_files().backup_file("r0").exists());

        harness.adm.clear_calls();
        harness.adm.set_adjustable(Some(vec![]));
        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("adjust"), 0);
        assert_eq!(harness.adm.count("create-md"), 0);
        assert_eq!(harness.adm.count("resize"), 0);
    }

    #[test]
    fn deleted_resource_is_taken_down_and_forgotten() {
        let env = TestEnvironment::new("reconcile_delete".to_string());
        let tracker = tracker_from_events(&[
            "exists resource name:r0 role:Secondary",
            "exists device name:r0 volume:0 minor:1000 disk:UpToDate client:no",
            "exists device name:r0 volume:1 minor:1001 disk:UpToDate client:no",
            "exists -",
        ]);
        let mut harness = Harness::new(&env, tracker);

        let mut rsc = drbd_resource("r0", &[0, 1]);
        let files = env.res_files();
        files.regenerate(&mut rsc).unwrap();
        files.backup(&rsc).unwrap();
        rsc.flags.insert(ResourceFlag::Delete);
        let mut resources = vec![LayerData::Drbd(Box::new(rsc))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("down r0"), 1);
        assert_eq!(harness.adm.count("adjust"), 0);
        assert_eq!(harness.adm.count("md-signature"), 0);
        assert_eq!(harness.adm.count("check-md"), 0);
        assert_eq!(harness.adm.count("create-md"), 0);
        assert!(!files.res_file("r0").exists());
        assert!(!files.backup_file("r0").exists());

        let rsc = drbd(&resources);
        assert!(!rsc.exists);
        assert!(rsc.volumes.values().all(|v| !v.exists));
        assert!(report
            .for_resource("r0")
            .any(|e| e.kind == EntryKind::Deleted));
        assert!(harness.link.messages().is_empty());
    }

    #[test]
    fn new_fat_volume_gets_metadata_sync_and_filesystem() {
        let env = TestEnvironment::new("reconcile_new_fat".to_string());
        let tracker = tracker_from_events(&["exists -"]);
        let mut harness = Harness::new(&env, Arc::clone(&tracker));

        // DRBD shows up as soon as it is adjusted
        let feeder = Arc::clone(&tracker);
        harness.adm.on_call("adjust r0", move || {
            feed_events(
                &feeder,
                &[
                    "create resource name:r0 role:Secondary",
                    "create device name:r0 volume:0 minor:1000 disk:Inconsistent client:no",
                ],
            );
        });

        let mut rsc = drbd_resource_with("r0", &[0], |def| {
            def.volumes.get_mut(&0).unwrap().fs_type = Some("ext4".to_string());
        });
        rsc.create_primary = true;
        let mut resources = vec![LayerData::Drbd(Box::new(rsc))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());

        let create_md = harness.position("create-md r0/0 7");
        let adjust = harness.position("adjust r0");
        let primary = harness.position("primary r0 --force");
        let mkfs = harness.position("mkfs.ext4 /dev/drbd1000");
        let secondary = harness.position("secondary r0");
        assert!(create_md < adjust && adjust < primary && primary < mkfs && mkfs < secondary);
        assert_eq!(harness.adm.count("primary"), 1);
        assert_eq!(harness.adm.count("mkfs"), 1);
        assert_eq!(harness.adm.count("set-gi"), 0);

        let rsc = drbd(&resources);
        assert!(rsc.volumes[&0].metadata_is_new);
        assert!(!rsc.create_primary);
        assert_eq!(rsc.definition.primary_set_on().as_deref(), Some("alpha"));
        assert_eq!(
            rsc.volumes[&0].device_path.as_deref(),
            Some("/dev/drbd1000")
        );
        assert_eq!(
            harness.link.messages(),
            vec![Notification::ResourceCreated {
                resource: "r0".to_string(),
                node: "alpha".to_string(),
            }]
        );
    }

    #[test]
    fn initialized_fat_volume_asks_for_a_primary() {
        let env = TestEnvironment::new("reconcile_request_primary".to_string());
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        harness
            .adm
            .set_gid(&data_device("r0", 0), "ABCDEF0123456789:0:0:0\n");
        let mut resources = vec![LayerData::Drbd(Box::new(drbd_resource("r0", &[0])))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert!(harness
            .link
            .messages()
            .contains(&Notification::RequestPrimary {
                resource: "r0".to_string(),
                node: "alpha".to_string(),
                already_initialized: true,
            }));
        assert_eq!(harness.adm.count("primary"), 0);
    }

    #[test]
    fn primary_peer_ends_the_primary_requests() {
        let env = TestEnvironment::new("reconcile_primary_peer".to_string());
        let tracker = tracker_from_events(&UP_TO_DATE);
        let mut harness = Harness::new(&env, Arc::clone(&tracker));
        let mut resources = vec![LayerData::Drbd(Box::new(drbd_resource("r0", &[0])))];

        harness.pass(&mut resources);
        let requests = |harness: &Harness| {
            harness
                .link
                .messages()
                .iter()
                .filter(|m| matches!(m, Notification::RequestPrimary { .. }))
                .count()
        };
        assert_eq!(requests(&harness), 1);

        // the controller picked beta
        feed_events(
            &tracker,
            &["create connection name:r0 peer-node-id:1 conn-name:beta connection:Connected role:Primary"],
        );
        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(requests(&harness), 1);
        assert_eq!(
            drbd(&resources).definition.primary_set_on().as_deref(),
            Some("beta")
        );

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(requests(&harness), 1);
    }

    #[test]
    fn grown_thin_volume_is_resized_before_adjust() {
        let env = TestEnvironment::new("reconcile_grow".to_string());
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        harness.adm.set_size_sectors(1000, 200);

        let mut rsc = primary_set("r0", &[0]);
        let vlm = rsc.volumes.get_mut(&0).unwrap();
        vlm.usable_size_kib = 200;
        vlm.flags.insert(VolumeFlag::Resize);
        vlm.flags.insert(VolumeFlag::DrbdResize);
        if let Some(child) = rsc.data_child.as_deref_mut().and_then(|c| c.as_child_mut()) {
            child.volumes.get_mut(&0).unwrap().thin = true;
        }
        let mut resources = vec![LayerData::Drbd(Box::new(rsc))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert!(harness.position("resize r0/0 assume-clean") < harness.position("adjust r0"));
        assert_eq!(harness.adm.count("resize"), 1);
        assert_eq!(drbd(&resources).volumes[&0].size_state, SizeState::AsExpected);
    }

    #[test]
    fn shrinking_peer_holds_back_the_adjust() {
        let env = TestEnvironment::new("reconcile_peer_shrinking".to_string());
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));

        let mut rsc = primary_set("r0", &[0]);
        let mut beta = peer("beta", 1);
        beta.volumes
            .get_mut(&0)
            .unwrap()
            .flags
            .insert(VolumeFlag::DrbdResize);
        rsc.peers.push(beta);
        let mut resources = vec![LayerData::Drbd(Box::new(rsc))];

        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("adjust"), 0);
        assert_eq!(harness.adm.count("resize"), 0);
        assert!(report
            .for_resource("r0")
            .any(|e| e.kind == EntryKind::Info && e.message.contains("not adjusted")));
    }

    #[test]
    fn failed_adjust_restores_the_backup() {
        let env = TestEnvironment::new("reconcile_adjust_fails".to_string());
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        let mut resources = vec![LayerData::Drbd(Box::new(primary_set("r0", &[0])))];
        harness.pass(&mut resources);
        let files = env.res_files();
        let good = std::fs::read_to_string(files.backup_file("r0")).unwrap();

        // a new peer changes the file; drbdadm rejects it
        if let LayerData::Drbd(rsc) = &mut resources[0] {
            rsc.peers.push(peer("beta", 1));
        }
        harness.adm.fail("adjust r0");
        let report = harness.pass(&mut resources);

        assert!(report.has_errors());
        assert!(report
            .for_resource("r0")
            .any(|e| e.kind == EntryKind::Error));
        assert_eq!(std::fs::read_to_string(files.res_file("r0")).unwrap(), good);
    }

    const SKIP_DISK_CONFIG: &str = r#"
local_node = "alpha"

[[nodes]]
name = "alpha"
address = "10.0.0.1"

[[nodes]]
name = "beta"
address = "10.0.0.2"

[[resources]]
name = "r0"
tcp_port = 7000

[[resources.volumes]]
number = 0
minor = 1000
size_kib = 1048576

[[resources.placements]]
node = "alpha"
node_id = 0
skip_disk = true

[[resources.placements.volumes]]
number = 0
backing_disk = "/dev/vg/r0_00000"

[[resources.placements]]
node = "beta"
node_id = 1
flags = ["DELETE"]
"#;

    const DISK_BACK_CONFIG: &str = r#"
local_node = "alpha"

[[nodes]]
name = "alpha"
address = "10.0.0.1"

[[resources]]
name = "r0"
tcp_port = 7000

[[resources.volumes]]
number = 0
minor = 1000
size_kib = 1048576

[[resources.placements]]
node = "alpha"
node_id = 0

[[resources.placements.volumes]]
number = 0
backing_disk = "/dev/vg/r0_00000"
"#;

    const CREATE_PRIMARY_CONFIG: &str = r#"
local_node = "alpha"

[[nodes]]
name = "alpha"
address = "10.0.0.1"

[[resources]]
name = "r0"
tcp_port = 7000

[[resources.volumes]]
number = 0
minor = 1000
size_kib = 1048576

[[resources.placements]]
node = "alpha"
node_id = 0
create_primary = true

[[resources.placements.volumes]]
number = 0
backing_disk = "/dev/vg/r0_00000"
"#;

    #[test]
    fn create_primary_is_not_repeated_after_a_restart() {
        let env = TestEnvironment::new("reconcile_create_primary_restart".to_string());
        let statefile = env.statefile_path();
        let config = Config::from_toml(CREATE_PRIMARY_CONFIG).unwrap();

        {
            let store = Arc::new(State::new(&statefile).unwrap());
            let mut cluster = Cluster::from_config(&config, Arc::clone(&store));
            let tracker = tracker_from_events(&["exists -"]);
            let mut harness = Harness::new(&env, Arc::clone(&tracker));
            harness.adm.on_call("adjust r0", move || {
                feed_events(
                    &tracker,
                    &[
                        "create resource name:r0 role:Secondary",
                        "create device name:r0 volume:0 minor:1000 disk:Inconsistent client:no",
                    ],
                );
            });

            let report = harness.pass(cluster.resources_mut());
            assert!(!report.has_errors(), "{:?}", report.entries());
            assert_eq!(harness.adm.count("primary r0 --force"), 1);
            assert_eq!(
                store
                    .get(&format!("resource-definitions/r0/{PROP_PRIMARY_SET}"))
                    .as_deref(),
                Some("alpha")
            );
        }

        // same configuration, the data is up to date by now
        let store = Arc::new(State::new(&statefile).unwrap());
        let mut cluster = Cluster::from_config(&config, Arc::clone(&store));
        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        let report = harness.pass(cluster.resources_mut());
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("create-md"), 0);
        assert_eq!(harness.adm.count("primary"), 0);
        assert!(!harness
            .link
            .messages()
            .iter()
            .any(|m| matches!(m, Notification::RequestPrimary { .. })));
    }

    #[test]
    fn create_primary_never_forces_existing_data() {
        let env = TestEnvironment::new("reconcile_create_primary_existing".to_string());
        let store = Arc::new(State::new(&env.statefile_path()).unwrap());
        let config = Config::from_toml(CREATE_PRIMARY_CONFIG).unwrap();
        let mut cluster = Cluster::from_config(&config, Arc::clone(&store));

        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        harness
            .adm
            .set_gid("/dev/vg/r0_00000", "ABCDEF0123456789:0:0:0\n");
        let report = harness.pass(cluster.resources_mut());
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("primary"), 0);
        assert!(harness
            .link
            .messages()
            .contains(&Notification::RequestPrimary {
                resource: "r0".to_string(),
                node: "alpha".to_string(),
                already_initialized: true,
            }));
    }

    #[test]
    fn suspend_io_follows_the_placement() {
        let env = TestEnvironment::new("reconcile_suspend_io".to_string());
        let tracker = tracker_from_events(&UP_TO_DATE);
        let mut harness = Harness::new(&env, Arc::clone(&tracker));
        let feeder = Arc::clone(&tracker);
        harness.adm.on_call("suspend-io r0", move || {
            feed_events(&feeder, &["change resource name:r0 suspended:user"]);
        });
        let feeder = Arc::clone(&tracker);
        harness.adm.on_call("resume-io r0", move || {
            feed_events(&feeder, &["change resource name:r0 suspended:no"]);
        });

        let mut rsc = primary_set("r0", &[0]);
        rsc.suspend_io = true;
        let mut resources = vec![LayerData::Drbd(Box::new(rsc))];
        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("suspend-io r0"), 1);
        assert!(harness.position("suspend-io r0") < harness.position("adjust r0"));
        assert!(drbd(&resources).suspended);

        // still suspended, nothing to do
        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("suspend-io"), 1);
        assert_eq!(harness.adm.count("resume-io"), 0);

        if let LayerData::Drbd(rsc) = &mut resources[0] {
            rsc.suspend_io = false;
        }
        let report = harness.pass(&mut resources);
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("resume-io r0"), 1);
        assert!(!drbd(&resources).suspended);
    }

    #[test]
    fn forget_peer_deferred_by_skip_disk_survives_a_restart() {
        let env = TestEnvironment::new("reconcile_skip_disk".to_string());
        let statefile = env.statefile_path();
        let key = format!("resources/r0/{KEY_DRBD_NODE_IDS_TO_RESET}");

        {
            let store = Arc::new(State::new(&statefile).unwrap());
            store
                .set(&format!("resource-definitions/r0/{PROP_PRIMARY_SET}"), "alpha")
                .unwrap();
            let config = Config::from_toml(SKIP_DISK_CONFIG).unwrap();
            let mut cluster = Cluster::from_config(&config, Arc::clone(&store));

            let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
            let report = harness.pass(cluster.resources_mut());
            assert!(!report.has_errors(), "{:?}", report.entries());
            assert_eq!(harness.adm.count("del-peer r0 1"), 1);
            assert_eq!(harness.adm.count("forget-peer"), 0);
            assert_eq!(harness.adm.count("adjust r0 --skip-disk"), 1);
            assert_eq!(store.get(&key).as_deref(), Some("1"));

            let content = std::fs::read_to_string(env.res_files().res_file("r0")).unwrap();
            assert!(!content.contains("/dev/vg/r0_00000"), "{content}");
        }

        let store = Arc::new(State::new(&statefile).unwrap());
        assert_eq!(store.get(&key).as_deref(), Some("1"));
        let config = Config::from_toml(DISK_BACK_CONFIG).unwrap();
        let mut cluster = Cluster::from_config(&config, Arc::clone(&store));

        let mut harness = Harness::new(&env, tracker_from_events(&UP_TO_DATE));
        let report = harness.pass(cluster.resources_mut());
        assert!(!report.has_errors(), "{:?}", report.entries());
        assert_eq!(harness.adm.count("forget-peer r0 1"), 1);
        assert!(harness.position("adjust r0") < harness.position("forget-peer r0 1"));
        assert!(store.get(&key).is_none());
        drop(store);

        let store = State::new(&statefile).unwrap();
        assert!(store.get(&key).is_none());
    }
}
