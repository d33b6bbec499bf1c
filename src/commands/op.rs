// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{handled_error, load_cluster, print_host_output, Cli, Handle, HandledResult},
    operation::DrbdOperation,
    reconcile::{AccessMode, CommandOutcome},
    resource::{EndpointId, VolumeId},
};

#[derive(Args, Debug, Clone)]
pub struct OpArgs {
    resource: String,
    volume: u32,
    host: String,

    /// One of attach, detach, connect, disconnect, set-primary, set-secondary, force-primary,
    /// invalidate, discard-data, resize, pause-sync, resume-sync, verify,
    /// skip-initial-full-sync.
    operation: String,

    /// Allow operations on resources used by the cluster resource manager.
    #[arg(long)]
    advanced: bool,

    /// Print what the host would do instead of doing it.
    #[arg(long)]
    preview: bool,
}

pub async fn op(cli: &Cli, args: &OpArgs) -> HandledResult<()> {
    let operation: DrbdOperation = args
        .operation
        .parse()
        .handle_err(|e| eprintln!("{e}"))?;
    let endpoint = EndpointId::new(VolumeId::new(&args.resource, args.volume), &args.host);
    let mode = if args.advanced {
        AccessMode::Advanced
    } else {
        AccessMode::Normal
    };

    let cluster = load_cluster(cli)?;
    for (host, e) in cluster.poll_status().await {
        eprintln!("Could not poll {host}: {e}");
    }

    let outcome = if args.preview {
        cluster.preview(&endpoint, operation, mode).await
    } else {
        cluster.apply(&endpoint, operation, mode).await
    };

    match outcome {
        CommandOutcome::Rejected(e) => {
            eprintln!("{e}");
            handled_error()
        }
        CommandOutcome::Done(runs) => {
            for run in runs.iter() {
                println!("{}: {}", run.host, run.command);
                if args.preview || cli.verbose {
                    print_host_output(&run.host, &run.output, true);
                }
            }
            Ok(())
        }
        CommandOutcome::Failed(runs) => {
            for run in runs.iter() {
                println!("{}: {}", run.host, run.command);
                print_host_output(&run.host, &run.output, true);
            }
            handled_error()
        }
    }
}
