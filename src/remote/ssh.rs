// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, process::Stdio};

use {
    log::{debug, trace},
    tokio::{io::AsyncWriteExt, process::Command},
};

use super::{shell_quote, CommandOutput, FileWrite, RemoteCommand, Transport, TransportError};

/// Suffix of the timestamped copy taken before a file is replaced.
pub fn backup_suffix() -> String {
    format!(".bak.{}", chrono::Local::now().format("%Y%m%d%H%M%S"))
}

/// Transport running commands through the system `ssh` client, relying on key based
/// authentication.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    ports: BTreeMap<String, u16>,
    user: Option<String>,
}

impl SshTransport {
    pub fn new(user: Option<String>) -> Self {
        Self {
            ports: BTreeMap::new(),
            user,
        }
    }

    /// Use `port` instead of the default ssh port for `host`.
    pub fn set_port(&mut self, host: &str, port: u16) {
        self.ports.insert(host.to_string(), port);
    }

    fn ssh(&self, host: &str, remote: &str) -> Command {
        let port = self
            .ports
            .get(host)
            .copied()
            .unwrap_or_else(crate::ssh_port);
        let destination = match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        let port = port.to_string();
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-p",
            port.as_str(),
            destination.as_str(),
            remote,
        ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        cmd
    }

    /// The shell script installing `file`: content arrives on standard input and is moved into
    /// place with a rename once complete.
    fn write_script(file: &FileWrite) -> String {
        let path = file.path();
        let tmp = format!("{path}.drbdmgr.tmp");
        let mut script = vec!["set -e".to_string()];
        if let Some(pre) = &file.pre_command {
            script.push(pre.to_string());
        }
        script.push(format!("mkdir -p {}", shell_quote(&file.directory)));
        if file.make_backup {
            let backup = format!("{path}{}", backup_suffix());
            script.push(format!(
                "if [ -e {p} ]; then cp -p {p} {b}; fi",
                p = shell_quote(&path),
                b = shell_quote(&backup)
            ));
        }
        script.push(format!("cat > {}", shell_quote(&tmp)));
        script.push(format!("chmod {:o} {}", file.mode, shell_quote(&tmp)));
        script.push(format!("mv -f {} {}", shell_quote(&tmp), shell_quote(&path)));
        if let Some(post) = &file.post_command {
            script.push(post.to_string());
        }
        script.join("\n")
    }
}

impl Transport for SshTransport {
    async fn execute(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, TransportError> {
        let line = command.to_string();
        debug!("{host}: running '{line}'");
        let output = self
            .ssh(host, &line)
            .output()
            .await
            .map_err(|e| TransportError::Unreachable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let exit_code = output.status.code().ok_or_else(|| TransportError::Killed {
            host: host.to_string(),
            command: line.clone(),
        })?;
        // ssh itself exits with 255 when the connection fails.
        if exit_code == 255 {
            return Err(TransportError::Unreachable {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        };
        trace!("{host}: '{line}' exited with {exit_code}: {}", output.combined());
        Ok(output)
    }

    async fn write_file(&self, host: &str, file: &FileWrite) -> Result<(), TransportError> {
        let path = file.path();
        debug!("{host}: writing {path}");
        let write_err = |reason: String| TransportError::Write {
            host: host.to_string(),
            path: path.clone(),
            reason,
        };

        let script = RemoteCommand::shell(&Self::write_script(file)).to_string();
        let mut child = self
            .ssh(host, &script)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Unreachable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(file.content.as_bytes())
                .await
                .map_err(|e| write_err(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| write_err(e.to_string()))?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(255) => Err(TransportError::Unreachable {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            _ => Err(write_err(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_script_installs_atomically() {
        let mut file = FileWrite::new("/etc/drbd.d", "r0.res", "resource r0 {}\n");
        file.make_backup = true;
        file.post_command = Some(RemoteCommand::new("sync"));
        let script = SshTransport::write_script(&file);
        let lines: Vec<_> = script.lines().collect();

        assert_eq!(lines[0], "set -e");
        assert_eq!(lines[1], "mkdir -p /etc/drbd.d");
        assert!(lines[2].starts_with("if [ -e /etc/drbd.d/r0.res ]; then cp -p /etc/drbd.d/r0.res /etc/drbd.d/r0.res.bak."));
        assert_eq!(lines[3], "cat > /etc/drbd.d/r0.res.drbdmgr.tmp");
        assert_eq!(lines[4], "chmod 644 /etc/drbd.d/r0.res.drbdmgr.tmp");
        assert_eq!(
            lines[5],
            "mv -f /etc/drbd.d/r0.res.drbdmgr.tmp /etc/drbd.d/r0.res"
        );
        assert_eq!(lines[6], "sync");
    }
}
