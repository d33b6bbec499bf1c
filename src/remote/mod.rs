// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Collaborators the engine talks to: the transport that runs commands and writes files on
//! hosts, and the cluster resource manager that may be using replicated resources.

pub mod drbdadm;
pub mod ssh;

use std::{collections::BTreeSet, fmt, future::Future};

use thiserror::Error;

/// A command to run on a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// A shell script run with `sh -c`.
    pub fn shell(script: &str) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Whether the program or any argument contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.to_string().contains(needle)
    }
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// The command line as it would be typed into a shell.
impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in self.args.iter() {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output followed by standard error, for display.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}

/// A file to install on a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub directory: String,
    pub filename: String,
    pub content: String,
    pub mode: u32,

    /// Keep a timestamped copy of an existing file before it is replaced.
    pub make_backup: bool,
    pub pre_command: Option<RemoteCommand>,
    pub post_command: Option<RemoteCommand>,
}

impl FileWrite {
    pub fn new(directory: &str, filename: &str, content: &str) -> Self {
        Self {
            directory: directory.to_string(),
            filename: filename.to_string(),
            content: content.to_string(),
            mode: 0o644,
            make_backup: false,
            pre_command: None,
            post_command: None,
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.directory.trim_end_matches('/'), self.filename)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not reach {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{host}: command timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    #[error("{host}: '{command}' was killed by a signal")]
    Killed { host: String, command: String },

    #[error("{host}: could not write {path}: {reason}")]
    Write {
        host: String,
        path: String,
        reason: String,
    },
}

/// Runs commands and writes files on cluster hosts. The engine never opens a connection itself.
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> impl Future<Output = Result<CommandOutput, TransportError>> + Send;

    fn write_file(
        &self,
        host: &str,
        file: &FileWrite,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read-only view of the cluster resource manager.
pub trait Crm: Send + Sync {
    /// Whether the CRM manages a resource on top of the replicated resource `resource`. Such
    /// resources are protected from destructive operations unless advanced mode is requested.
    fn is_resource_used_by_crm(&self, resource: &str) -> bool;
}

/// A cluster without a resource manager.
#[derive(Debug, Default)]
pub struct NoCrm;

impl Crm for NoCrm {
    fn is_resource_used_by_crm(&self, _resource: &str) -> bool {
        false
    }
}

/// A fixed list of CRM-managed resources, typically from the cluster file.
#[derive(Debug, Default)]
pub struct StaticCrm {
    resources: BTreeSet<String>,
}

impl StaticCrm {
    pub fn new<I: IntoIterator<Item = String>>(resources: I) -> Self {
        Self {
            resources: resources.into_iter().collect(),
        }
    }
}

impl Crm for StaticCrm {
    fn is_resource_used_by_crm(&self, resource: &str) -> bool {
        self.resources.contains(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quoting() {
        let cmd = RemoteCommand::new("drbdadm").args(["-d", "adjust", "all"]);
        assert_eq!(cmd.to_string(), "drbdadm -d adjust all");

        let cmd = RemoteCommand::shell("test -e '/etc/drbd.d' && echo yes");
        assert_eq!(
            cmd.to_string(),
            "sh -c 'test -e '\\''/etc/drbd.d'\\'' && echo yes'"
        );
        assert!(cmd.contains("test -e"));

        assert_eq!(shell_quote("/dev/sdc[0]"), "'/dev/sdc[0]'");
        assert_eq!(shell_quote("r0/1"), "r0/1");
    }

    #[test]
    fn static_crm() {
        let crm = StaticCrm::new(["r0".to_string()]);
        assert!(crm.is_resource_used_by_crm("r0"));
        assert!(!crm.is_resource_used_by_crm("r1"));
        assert!(!NoCrm.is_resource_used_by_crm("r0"));
    }
}
