// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use drbdmgr_lib::{
    self,
    commands::{self, Cli},
};

/// The drbdmgr binary renders, evaluates and applies the replication configuration of a cluster.
fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(drbdmgr_lib::LOG_ENV, "warn"),
    )
    .init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
