// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Command lines of the DRBD userland tools and of the probes used for discovery.

use crate::{host::DrbdVersion, resource::VolumeId};

use super::RemoteCommand;

/// Global options placed before the drbdadm subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation<'a> {
    /// `-d`: print the commands instead of running them.
    pub dry_run: bool,

    /// `-c <file>`: use a configuration file other than the default.
    pub config: Option<&'a str>,
}

impl<'a> Invocation<'a> {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn dry_run(config: Option<&'a str>) -> Self {
        Self {
            dry_run: true,
            config,
        }
    }
}

/// `drbdadm <subcommand> <target>` with subcommand options. DRBD 8.4 takes the options after the
/// subcommand, earlier releases pass them through after a `--` separator.
pub fn drbdadm(
    version: DrbdVersion,
    invocation: &Invocation,
    subcommand: &str,
    options: &[&str],
    target: &str,
) -> RemoteCommand {
    let mut cmd = RemoteCommand::new("drbdadm");
    if invocation.dry_run {
        cmd = cmd.arg("-d");
    }
    if let Some(config) = invocation.config {
        cmd = cmd.args(["-c", config]);
    }
    if version.has_volumes() {
        cmd.arg(subcommand).args(options.iter().copied()).arg(target)
    } else {
        if !options.is_empty() {
            cmd = cmd.arg("--").args(options.iter().copied());
        }
        cmd.arg(subcommand).arg(target)
    }
}

/// The drbdadm target of a volume: `res/vol` with volume support, just the resource before.
pub fn volume_target(version: DrbdVersion, volume: &VolumeId) -> String {
    if version.has_volumes() {
        volume.to_string()
    } else {
        volume.resource.clone()
    }
}

/// Apply the configuration to the running kernel state. Proxy hosts bring up the proxy instead.
pub fn adjust_all(version: DrbdVersion, invocation: &Invocation, proxy: bool) -> RemoteCommand {
    let subcommand = if proxy { "proxy-up" } else { "adjust" };
    drbdadm(version, invocation, subcommand, &[], "all")
}

pub fn down(version: DrbdVersion, resource: &str) -> RemoteCommand {
    drbdadm(version, &Invocation::live(), "down", &[], resource)
}

pub fn detach(version: DrbdVersion, volume: &VolumeId) -> RemoteCommand {
    drbdadm(
        version,
        &Invocation::live(),
        "detach",
        &[],
        &volume_target(version, volume),
    )
}

/// Remove a minor from the kernel after its volume was detached and disconnected.
pub fn del_minor(version: DrbdVersion, minor: u32) -> RemoteCommand {
    if version.has_volumes() {
        RemoteCommand::new("drbdsetup").args(["del-minor".to_string(), minor.to_string()])
    } else {
        RemoteCommand::new("drbdsetup").args([format!("/dev/drbd{minor}"), "down".to_string()])
    }
}

/// Parsed configuration as drbdadm sees it, including files it includes.
pub fn dump_all() -> RemoteCommand {
    RemoteCommand::new("drbdadm").args(["dump", "all"])
}

pub fn version() -> RemoteCommand {
    RemoteCommand::new("drbdadm").arg("--version")
}

pub fn proc_drbd() -> RemoteCommand {
    RemoteCommand::new("cat").arg("/proc/drbd")
}

pub fn lsblk() -> RemoteCommand {
    RemoteCommand::new("lsblk").args(["-P", "-p", "-o", "NAME,TYPE,FSTYPE,MOUNTPOINT"])
}

/// Whether the kernel module is loaded; exits non-zero when it is not.
pub fn module_loaded() -> RemoteCommand {
    RemoteCommand::new("test").args(["-e", "/proc/drbd"])
}

/// Print each of `paths` that exists, one per line.
pub fn probe_paths(paths: &[String]) -> RemoteCommand {
    let list: Vec<String> = paths.iter().map(|p| super::shell_quote(p)).collect();
    RemoteCommand::shell(&format!(
        "for p in {}; do if [ -e \"$p\" ]; then echo \"$p\"; fi; done",
        list.join(" ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const V84: DrbdVersion = DrbdVersion::new(8, 4, 11);
    const V83: DrbdVersion = DrbdVersion::new(8, 3, 16);

    #[test]
    fn option_syntax_follows_version() {
        let cmd = drbdadm(V84, &Invocation::live(), "primary", &["--force"], "r0");
        assert_eq!(cmd.to_string(), "drbdadm primary --force r0");

        let cmd = drbdadm(
            V83,
            &Invocation::live(),
            "primary",
            &["--overwrite-data-of-peer"],
            "r0",
        );
        assert_eq!(cmd.to_string(), "drbdadm -- --overwrite-data-of-peer primary r0");
    }

    #[test]
    fn dry_run_adjust() {
        let inv = Invocation::dry_run(Some("/var/lib/drbd/drbdmgr-test/drbd.conf"));
        assert_eq!(
            adjust_all(V84, &inv, false).to_string(),
            "drbdadm -d -c /var/lib/drbd/drbdmgr-test/drbd.conf adjust all"
        );
        assert_eq!(
            adjust_all(V84, &Invocation::live(), true).to_string(),
            "drbdadm proxy-up all"
        );
    }

    #[test]
    fn teardown_commands() {
        let vol = VolumeId::new("r0", 1);
        assert_eq!(detach(V84, &vol).to_string(), "drbdadm detach r0/1");
        assert_eq!(detach(V83, &vol).to_string(), "drbdadm detach r0");
        assert_eq!(del_minor(V84, 3).to_string(), "drbdsetup del-minor 3");
        assert_eq!(del_minor(V83, 3).to_string(), "drbdsetup /dev/drbd3 down");
    }
}
