// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{load_cluster, Cli, HandledResult},
    resource::{EndpointId, VolumeId},
    state::VolumeStatus,
};

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only show volumes that are not connected and in sync.
    #[arg(short = 'x')]
    exclude_normal: bool,
}

fn summary(status: &VolumeStatus) -> &'static str {
    if status.is_split_brain() {
        "SPLIT-BRAIN"
    } else if status.is_syncing() {
        "SYNCING"
    } else if status.is_verifying() {
        "VERIFYING"
    } else if status.is_diskless() {
        "DISKLESS"
    } else if status.is_connected_or_wf() && status.is_connected() {
        "OK"
    } else if status.is_connected_or_wf() {
        "WAITING"
    } else {
        "DISCONNECTED"
    }
}

pub async fn status(cli: &Cli, args: &StatusArgs) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;
    for (host, e) in cluster.poll_status().await {
        eprintln!("Could not poll {host}: {e}");
    }

    let volumes: Vec<(VolumeId, Vec<String>)> = cluster.read(|t| {
        t.resources()
            .flat_map(|r| {
                r.volumes().map(|v| {
                    (
                        VolumeId::new(r.name(), v.number()),
                        v.endpoints().map(|(h, _)| h.to_string()).collect(),
                    )
                })
            })
            .collect()
    });

    for (id, hosts) in volumes {
        let Some(status) = cluster.volume_status(&id) else {
            continue;
        };
        let summary = summary(&status);
        if args.exclude_normal && summary == "OK" {
            continue;
        }
        print!("{summary}: {id} [");
        for (i, host) in hosts.iter().enumerate() {
            if i > 0 {
                print!(", ");
            }
            let endpoint = EndpointId::new(id.clone(), host);
            match cluster.endpoint_status(&endpoint) {
                Some(s) => print!("{host}: {s}"),
                None => print!("{host}: unknown"),
            }
        }
        println!("]");
    }
    Ok(())
}
