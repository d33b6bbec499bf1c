// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{load_cluster, Cli, Handle, HandledResult};

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Only render the configuration of these hosts.
    #[arg()]
    hosts: Vec<String>,
}

pub fn render(cli: &Cli, args: &RenderArgs) -> HandledResult<()> {
    let cluster = load_cluster(cli)?;
    let rendered = cluster
        .plan()
        .handle_err(|e| eprintln!("Configuration error: {e}"))?;

    for (host, config) in rendered.iter() {
        if !args.hosts.is_empty() && !args.hosts.contains(host) {
            continue;
        }
        println!("##### {host}");
        print!("{}", config.to_text());
    }
    Ok(())
}
