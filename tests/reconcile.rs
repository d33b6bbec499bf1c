// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use tokio::runtime::Runtime;

    use drbdmgr_lib::{
        host::DrbdVersion,
        operation::{DrbdOperation, OperationError},
        overlay::Prediction,
        params::Section,
        reconcile::{AccessMode, ApplyOutcome, CommandOutcome, RepairAction, TeardownOutcome},
        render::ConfigError,
        resource::{HostBinding, VolumeId},
        state::ConnectionState,
        test_env::*,
    };

    const DRY_RUN_ADJUST: &str = "drbdadm -d -c /var/lib/drbd/drbdmgr-test/drbd.conf adjust all";

    fn v84() -> DrbdVersion {
        DrbdVersion::new(8, 4, 11)
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        Runtime::new().unwrap().block_on(f)
    }

    #[test]
    fn failed_dry_run_touches_nothing_live() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .transport()
            .fail(BETA, DRY_RUN_ADJUST, 10, "r0: syntax error");

        let outcome = block_on(cluster.create_drbd_config_live());
        let ApplyOutcome::DryRunFailed(report) = outcome else {
            panic!("expected the dry-run to fail, got {outcome:?}");
        };
        assert_eq!(report.failed_hosts().collect::<Vec<_>>(), vec![BETA]);
        assert!(report.outputs[ALPHA].is_ok());
        assert_eq!(report.outputs[BETA].exit_code, Some(10));

        for (_, write) in cluster.transport().writes() {
            assert!(
                write.directory.starts_with("/var/lib/drbd/drbdmgr-test"),
                "live write to {}",
                write.path()
            );
        }
        for host in [ALPHA, BETA] {
            let executed = cluster.transport().executed(host);
            assert!(!executed.iter().any(|c| c == "drbdadm adjust all"));
            assert!(!executed.iter().any(|c| c.contains("/etc/drbd.d")));
        }
        assert!(!cluster.read(|t| t.resource("r0").unwrap().committed));
    }

    #[test]
    fn configuration_errors_reach_no_host() {
        let mut topology = two_host_topology(v84());
        let mut bindings = bindings(&[(ALPHA, "10.0.0.1")]);
        bindings.insert(BETA.to_string(), HostBinding::default());
        topology.update_resource_bindings("r0", bindings).unwrap();
        let cluster = mock_cluster(topology);

        let outcome = block_on(cluster.create_drbd_config_live());
        assert!(matches!(
            outcome,
            ApplyOutcome::Rejected(ConfigError::MissingAddress { .. })
        ));
        assert!(cluster.transport().calls().is_empty());
        assert!(cluster.overlay().is_none());
    }

    #[test]
    fn split_layout_is_staged_then_swapped() {
        let cluster = mock_cluster(two_host_topology(v84()));

        let outcome = block_on(cluster.create_drbd_config_live());
        assert!(outcome.is_applied(), "{outcome:?}");

        let live_writes: Vec<String> = cluster
            .transport()
            .writes()
            .into_iter()
            .filter(|(host, w)| host == ALPHA && w.directory.starts_with("/etc"))
            .map(|(_, w)| w.path())
            .collect();
        assert_eq!(
            live_writes,
            vec![
                "/etc/drbd.conf.temp",
                "/etc/drbd.d.temp/global_common.conf",
                "/etc/drbd.d.temp/r0.res",
            ]
        );

        let executed = cluster.transport().executed(ALPHA);
        let dry = executed.iter().position(|c| c == DRY_RUN_ADJUST).unwrap();
        let swap = executed
            .iter()
            .position(|c| c.contains("mv /etc/drbd.d.temp /etc/drbd.d"))
            .unwrap();
        let live = executed
            .iter()
            .position(|c| c == "drbdadm adjust all")
            .unwrap();
        assert!(dry < swap && swap < live);

        assert!(cluster.read(|t| {
            let r0 = t.resource("r0").unwrap();
            r0.committed && r0.volume(0).unwrap().committed
        }));
    }

    #[test]
    fn single_file_layout_is_backed_up() {
        let cluster = mock_cluster(two_host_topology(DrbdVersion::new(8, 2, 7)));

        let outcome = block_on(cluster.create_drbd_config_live());
        assert!(outcome.is_applied(), "{outcome:?}");

        let live: Vec<_> = cluster
            .transport()
            .writes()
            .into_iter()
            .filter(|(host, w)| host == BETA && w.directory == "/etc")
            .map(|(_, w)| w)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].filename, "drbd.conf");
        assert!(live[0].make_backup);
        assert!(live[0].content.contains("on beta {"));
    }

    #[test]
    fn unreachable_host_fails_dry_run_but_others_finish() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster.transport().set_unreachable(BETA);

        let report = block_on(cluster.create_config_dry_run()).unwrap();
        assert!(!report.all_ok());
        assert!(report.outputs[BETA].error.is_some());
        assert_eq!(report.outputs[BETA].exit_code, None);
        assert!(cluster
            .transport()
            .executed(ALPHA)
            .contains(&DRY_RUN_ADJUST.to_string()));
    }

    #[test]
    fn dry_run_fills_the_overlay() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster.transport().respond(
            ALPHA,
            DRY_RUN_ADJUST,
            "drbdsetup-84 connect r0 ipv4:10.0.0.1:7788 ipv4:10.0.0.2:7788 --protocol=C\n",
        );

        let report = block_on(cluster.create_config_dry_run()).unwrap();
        assert!(report.all_ok());

        let overlay = cluster.overlay().unwrap();
        assert!(overlay.predicts(ALPHA, "r0", Prediction::Connected));
        assert!(overlay.output(ALPHA).unwrap().output.contains("connect r0"));

        let id = endpoint("r0", 0, ALPHA);
        assert_eq!(
            cluster.predicted_status(&id).unwrap().connection,
            ConnectionState::Connected
        );
        assert_eq!(
            cluster.endpoint_status(&id).unwrap().connection,
            ConnectionState::StandAlone
        );

        cluster.exit_test_mode();
        assert!(cluster.overlay().is_none());
        assert_eq!(
            cluster.predicted_status(&id).unwrap().connection,
            ConnectionState::StandAlone
        );
    }

    #[test]
    fn set_primary_demotes_the_peer() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| {
                t.set_endpoint_status(&endpoint("r0", 0, ALPHA), primary())?;
                t.set_endpoint_status(&endpoint("r0", 0, BETA), connected())
            })
            .unwrap();

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::SetPrimary,
            AccessMode::Normal,
        ));
        let CommandOutcome::Done(runs) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        let commands: Vec<(String, String)> = runs
            .iter()
            .map(|r| (r.host.clone(), r.command.to_string()))
            .collect();
        assert_eq!(
            commands,
            vec![
                (ALPHA.to_string(), "drbdadm secondary r0".to_string()),
                (BETA.to_string(), "drbdadm primary r0".to_string()),
            ]
        );
    }

    #[test]
    fn set_primary_with_two_primaries_allowed() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| {
                t.resource_params_mut("r0")?
                    .set_flag(Section::Net, "allow-two-primaries", true);
                t.set_endpoint_status(&endpoint("r0", 0, ALPHA), primary())?;
                t.set_endpoint_status(&endpoint("r0", 0, BETA), connected())
            })
            .unwrap();

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::SetPrimary,
            AccessMode::Normal,
        ));
        let CommandOutcome::Done(runs) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].host, BETA);
        assert!(cluster.transport().executed(ALPHA).is_empty());
    }

    #[test]
    fn discard_data_is_refused_while_syncing() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| {
                t.set_endpoint_status(
                    &endpoint("r0", 0, ALPHA),
                    drbdmgr_lib::state::DeviceStatus {
                        role: drbdmgr_lib::state::Role::Primary,
                        ..sync_source()
                    },
                )?;
                t.set_endpoint_status(&endpoint("r0", 0, BETA), sync_target())
            })
            .unwrap();

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::DiscardData,
            AccessMode::Normal,
        ));
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(OperationError::Illegal {
                reason: "resync in progress",
                ..
            })
        ));
        assert!(cluster.transport().calls().is_empty());
    }

    #[test]
    fn discard_data_is_refused_on_a_primary() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| t.set_endpoint_status(&endpoint("r0", 0, BETA), primary()))
            .unwrap();

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::DiscardData,
            AccessMode::Normal,
        ));
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(OperationError::Illegal {
                reason: "device is primary",
                ..
            })
        ));
    }

    #[test]
    fn discard_data_on_an_idle_secondary() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| t.set_endpoint_status(&endpoint("r0", 0, BETA), connected()))
            .unwrap();

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::DiscardData,
            AccessMode::Normal,
        ));
        assert!(matches!(outcome, CommandOutcome::Done(_)));
        assert_eq!(
            cluster.transport().executed(BETA),
            vec!["drbdadm disconnect r0", "drbdadm connect --discard-my-data r0"]
        );
    }

    #[test]
    fn failed_command_stops_the_sequence() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| {
                t.set_endpoint_status(&endpoint("r0", 0, ALPHA), primary())?;
                t.set_endpoint_status(&endpoint("r0", 0, BETA), connected())
            })
            .unwrap();
        cluster
            .transport()
            .fail(ALPHA, "secondary", 11, "Device is held open by someone");

        let outcome = block_on(cluster.apply(
            &endpoint("r0", 0, BETA),
            DrbdOperation::SetPrimary,
            AccessMode::Normal,
        ));
        let CommandOutcome::Failed(runs) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(runs.len(), 1);
        assert!(runs[0].output.output.contains("held open"));
        assert!(cluster.transport().executed(BETA).is_empty());
    }

    #[test]
    fn crm_resources_need_advanced_mode() {
        let cluster = crm_cluster(two_host_topology(v84()), &["r0"]);
        cluster
            .mutate(|t| t.set_endpoint_status(&endpoint("r0", 0, ALPHA), connected()))
            .unwrap();
        let id = endpoint("r0", 0, ALPHA);

        let outcome = block_on(cluster.apply(&id, DrbdOperation::Detach, AccessMode::Normal));
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(OperationError::UsedByCrm { .. })
        ));

        // Not destructive, so not gated.
        let outcome = block_on(cluster.apply(&id, DrbdOperation::Verify, AccessMode::Normal));
        assert!(matches!(outcome, CommandOutcome::Done(_)));

        let outcome = block_on(cluster.apply(&id, DrbdOperation::Detach, AccessMode::Advanced));
        assert!(matches!(outcome, CommandOutcome::Done(_)));
        assert!(cluster
            .transport()
            .executed(ALPHA)
            .contains(&"drbdadm detach r0/0".to_string()));

        let outcome = block_on(cluster.remove_resource("r0", AccessMode::Normal));
        assert!(matches!(outcome, TeardownOutcome::Rejected(_)));
        assert!(cluster.read(|t| t.resource("r0").is_some()));
    }

    #[test]
    fn preview_runs_dry() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .mutate(|t| t.set_endpoint_status(&endpoint("r0", 0, ALPHA), connected()))
            .unwrap();

        let outcome = block_on(cluster.preview(
            &endpoint("r0", 0, ALPHA),
            DrbdOperation::Invalidate,
            AccessMode::Normal,
        ));
        assert!(matches!(outcome, CommandOutcome::Done(_)));
        assert_eq!(
            cluster.transport().executed(ALPHA),
            vec!["drbdadm -d invalidate r0/0"]
        );
        assert!(cluster.overlay().is_none());
    }

    #[test]
    fn removing_volumes_tears_them_down() {
        let mut topology = two_host_topology(v84());
        topology
            .add_volume("r0", &[(ALPHA, "/dev/sdc"), (BETA, "/dev/sdc")], "/dev/drbd1")
            .unwrap();
        topology.mark_committed();
        let cluster = mock_cluster(topology);

        let outcome = block_on(cluster.remove_volume(&VolumeId::new("r0", 1), AccessMode::Normal));
        let TeardownOutcome::Removed { teardown, commit } = outcome else {
            panic!("expected removal, got {outcome:?}");
        };
        let alpha: Vec<String> = teardown
            .iter()
            .filter(|r| r.host == ALPHA)
            .map(|r| r.command.to_string())
            .collect();
        assert_eq!(alpha, vec!["drbdadm detach r0/1", "drbdsetup del-minor 1"]);
        assert!(commit.is_applied());
        assert!(cluster.read(|t| t.volume(&VolumeId::new("r0", 1)).is_none()));
        assert!(cluster.read(|t| t
            .host(ALPHA)
            .unwrap()
            .block_device("/dev/sdc")
            .unwrap()
            .is_free()));

        // The last volume takes the resource with it.
        cluster.transport().clear_calls();
        let outcome = block_on(cluster.remove_volume(&VolumeId::new("r0", 0), AccessMode::Normal));
        let TeardownOutcome::Removed { teardown, .. } = outcome else {
            panic!("expected removal, got {outcome:?}");
        };
        assert!(teardown.iter().all(|r| r.command.to_string() == "drbdadm down r0"));
        assert_eq!(teardown.len(), 2);
        assert!(cluster.read(|t| t.resource("r0").is_none()));
    }

    #[test]
    fn uncommitted_volumes_need_no_teardown() {
        let cluster = mock_cluster(two_host_topology(v84()));
        let outcome = block_on(cluster.remove_resource("r0", AccessMode::Normal));
        let TeardownOutcome::Removed { teardown, commit } = outcome else {
            panic!("expected removal, got {outcome:?}");
        };
        assert!(teardown.is_empty());
        assert!(commit.is_applied());
    }

    #[test]
    fn changes_made_during_a_commit_stay_pending() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster
            .transport()
            .stall("drbdadm adjust all", Duration::from_millis(300));

        let (outcome, added) = block_on(async {
            futures::join!(cluster.create_drbd_config_live(), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cluster.mutate(|t| {
                    t.add_volume("r0", &[(ALPHA, "/dev/sdc"), (BETA, "/dev/sdc")], "/dev/drbd1")
                })
            })
        });
        assert!(outcome.is_applied(), "{outcome:?}");
        let added = added.unwrap();

        cluster.read(|t| {
            assert!(t.volume(&VolumeId::new("r0", 0)).unwrap().committed);
            assert!(!t.volume(&added).unwrap().committed);
        });

        // Never pushed, so nothing to tear down on the hosts.
        cluster.transport().clear_calls();
        let outcome = block_on(cluster.remove_volume(&added, AccessMode::Normal));
        let TeardownOutcome::Removed { teardown, .. } = outcome else {
            panic!("expected removal, got {outcome:?}");
        };
        assert!(teardown.is_empty());
    }

    #[test]
    fn device_paths_are_reserved_under_the_lock() {
        let cluster = mock_cluster(two_host_topology(v84()));
        let (first, second) = block_on(async {
            futures::join!(
                cluster.reserve_new_volume_device_path(),
                cluster.reserve_new_volume_device_path()
            )
        });
        let mut paths = vec![first.unwrap(), second.unwrap()];
        paths.sort();
        assert_eq!(paths, vec!["/dev/drbd1", "/dev/drbd2"]);
        assert_eq!(block_on(cluster.new_resource_name()), "r1");
    }

    #[test]
    fn repair_rolls_back_an_interrupted_swap() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster.transport().respond(
            ALPHA,
            "for p in",
            "/etc/drbd.d.old\n/etc/drbd.d.temp\n/etc/drbd.conf.temp\n",
        );
        cluster
            .transport()
            .respond(BETA, "for p in", "/etc/drbd.d\n");

        let results: BTreeMap<_, _> = block_on(cluster.repair());
        assert_eq!(results[ALPHA], Ok(RepairAction::RollBack));
        assert_eq!(results[BETA], Ok(RepairAction::Nothing));
        assert!(cluster
            .transport()
            .executed(ALPHA)
            .iter()
            .any(|c| c.contains("mv /etc/drbd.d.old /etc/drbd.d")));
        assert_eq!(cluster.transport().executed(BETA).len(), 1);
    }

    #[test]
    fn polling_updates_status() {
        let cluster = mock_cluster(two_host_topology(v84()));
        cluster.transport().respond(
            ALPHA,
            "/proc/drbd",
            " 0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----\n",
        );
        cluster.transport().set_unreachable(BETA);

        let failures = block_on(cluster.poll_status());
        assert!(failures.contains_key(BETA));
        assert!(!cluster.read(|t| t.host(BETA).unwrap().connected));

        let status = cluster.endpoint_status(&endpoint("r0", 0, ALPHA)).unwrap();
        assert!(status.is_primary());
        assert!(status.is_syncing());
        assert!(cluster
            .volume_status(&VolumeId::new("r0", 0))
            .unwrap()
            .is_syncing());
    }
}
