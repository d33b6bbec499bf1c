// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{handled_error, load_cluster, print_host_output, Cli, HandledResult},
    reconcile::RepairAction,
};

pub async fn repair(cli: &Cli) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;
    let mut failed = false;
    for (host, result) in cluster.repair().await {
        match result {
            Ok(RepairAction::Nothing) => {
                if cli.verbose {
                    println!("{host}: nothing to repair");
                }
            }
            Ok(action) => println!("{host}: {action:?}"),
            Err(out) => {
                print_host_output(&host, &out, true);
                failed = true;
            }
        }
    }
    if failed {
        handled_error()
    } else {
        Ok(())
    }
}
