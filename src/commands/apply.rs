// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{handled_error, load_cluster, print_host_output, Cli, Handle, HandledResult},
    reconcile::ApplyOutcome,
};

pub async fn dry_run(cli: &Cli) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;
    let report = cluster
        .create_config_dry_run()
        .await
        .handle_err(|e| eprintln!("Configuration error, nothing sent: {e}"))?;

    for (host, out) in report.outputs.iter() {
        print_host_output(host, out, true);
    }
    if report.all_ok() {
        Ok(())
    } else {
        handled_error()
    }
}

pub async fn apply(cli: &Cli) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;
    match cluster.create_drbd_config_live().await {
        ApplyOutcome::Rejected(e) => {
            eprintln!("Configuration error, nothing sent: {e}");
            handled_error()
        }
        ApplyOutcome::DryRunFailed(report) => {
            eprintln!("Dry-run failed, the live configuration was not changed:");
            for (host, out) in report.outputs.iter() {
                print_host_output(host, out, cli.verbose);
            }
            handled_error()
        }
        ApplyOutcome::CommitFailed { commit, .. } => {
            eprintln!("Commit failed on some hosts:");
            for (host, out) in commit.iter() {
                print_host_output(host, out, cli.verbose);
            }
            handled_error()
        }
        ApplyOutcome::Applied { commit, .. } => {
            for (host, out) in commit.iter() {
                print_host_output(host, out, cli.verbose);
            }
            Ok(())
        }
    }
}
