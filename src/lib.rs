// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod host;
pub mod operation;
pub mod overlay;
pub mod params;
pub mod parser;
pub mod reconcile;
pub mod remote;
pub mod render;
pub mod resource;
pub mod state;
pub mod test_env;
pub mod topology;

/// Gets the port that ssh connections to the hosts use unless a host names its own.
pub fn ssh_port() -> u16 {
    match std::env::var("DRBDMGR_SSH_PORT") {
        Ok(port) => port
            .parse::<u16>()
            .expect("DRBDMGR_SSH_PORT must be a valid port number"),
        Err(_) => 22,
    }
}

pub fn default_config_path() -> String {
    match std::env::var("DRBDMGR_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/drbdmgr/cluster.toml".to_string(),
    }
}

/// Name of the environment variable holding the log filter of the admin binary.
pub const LOG_ENV: &str = "DRBDMGR_LOG";
