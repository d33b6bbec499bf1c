// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod apply;
pub mod discover;
pub mod op;
pub mod render;
pub mod repair;
pub mod status;

use {
    discover::DiscoverArgs, op::OpArgs, render::RenderArgs, status::StatusArgs,
};

use clap::{Parser, Subcommand};

use crate::{cluster::Cluster, overlay::HostOutput, remote::ssh::SshTransport};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the configuration the cluster file renders to.
    Render(RenderArgs),
    /// Evaluate the configuration on every host without changing anything.
    DryRun,
    /// Dry-run, then install the configuration and adjust every host.
    Apply,
    Status(StatusArgs),
    /// Scan hosts and print the cluster file describing what they run.
    Discover(DiscoverArgs),
    /// Resolve configuration swaps that were interrupted.
    Repair,
    /// Request an operation on one endpoint of a volume.
    Op(OpArgs),
}

fn load_cluster(cli: &Cli) -> HandledResult<Cluster<SshTransport>> {
    Cluster::from_config(cli.config.clone())
        .handle_err(|e| eprintln!("Could not load cluster: {e}"))
}

/// Print what a host answered, indented under its name.
fn print_host_output(host: &str, out: &HostOutput, verbose: bool) {
    let status = if out.is_ok() { "OK" } else { "FAILED" };
    println!("{host}: {status}");
    if let Some(e) = &out.error {
        println!("    {e}");
    }
    if verbose || !out.is_ok() {
        for line in out.output.lines() {
            println!("    {line}");
        }
    }
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    if let Commands::Render(args) = &cli.command {
        return render::render(cli, args);
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Discover(args) => discover::discover(cli, args).await,
            Commands::DryRun => apply::dry_run(cli).await,
            Commands::Apply => apply::apply(cli).await,
            Commands::Status(args) => status::status(cli, args).await,
            Commands::Repair => repair::repair(cli).await,
            Commands::Op(args) => op::op(cli, args).await,
            Commands::Render(_) => unreachable!(),
        }
    })
}
