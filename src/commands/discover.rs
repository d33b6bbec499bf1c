// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    cluster::Cluster,
    commands::{handled_error, Cli, Handle, HandledResult},
    config::{Config, EngineSettings},
    remote::{ssh::SshTransport, NoCrm},
    topology::Topology,
};

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    #[arg(long)]
    ssh_user: Option<String>,

    #[arg()]
    hostnames: Vec<String>,
}

/// Scan the given hosts and print a cluster file describing them.
pub async fn discover(cli: &Cli, args: &DiscoverArgs) -> HandledResult<()> {
    let settings = EngineSettings {
        ssh_user: args.ssh_user.clone(),
        ..Default::default()
    };
    let transport = SshTransport::new(settings.ssh_user.clone());
    let cluster = Cluster::new(Topology::new(), transport, Box::new(NoCrm), settings.clone());

    let mut failed = false;
    for (host, result) in cluster.discover(&args.hostnames).await {
        match result {
            Ok(()) if cli.verbose => eprintln!("Discovered {host}"),
            Ok(()) => {}
            Err(e) => {
                eprintln!("Could not discover {host}: {e}");
                failed = true;
            }
        }
    }

    let config = cluster.read(|t| Config::from_topology(t, settings, Vec::new()));
    let text = config
        .to_toml()
        .handle_err(|e| eprintln!("Could not serialize cluster file: {e}"))?;
    println!("{text}");

    if failed {
        handled_error()
    } else {
        Ok(())
    }
}
