// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Shared fixtures for tests: a transport that records what the engine asks of the hosts and
//! answers from a script, and small clusters to run it against.

use std::{collections::BTreeSet, sync::Mutex, time::Duration};

use crate::{
    cluster::Cluster,
    config::EngineSettings,
    host::{BlockDevice, DrbdVersion, Host},
    remote::{CommandOutput, Crm, FileWrite, NoCrm, RemoteCommand, StaticCrm, Transport, TransportError},
    resource::{Address, EndpointId, HostBinding, VolumeId},
    state::{ConnectionState, DeviceStatus, DiskState, Role, SyncState},
    topology::Topology,
};

/// One request made to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Execute { host: String, command: RemoteCommand },
    Write { host: String, file: FileWrite },
}

impl Call {
    pub fn host(&self) -> &str {
        match self {
            Call::Execute { host, .. } | Call::Write { host, .. } => host,
        }
    }
}

struct Rule {
    /// `None` matches every host.
    host: Option<String>,
    needle: String,
    reply: Result<CommandOutput, TransportError>,
}

/// A transport that never leaves the process. Commands are answered by the most recently added
/// rule whose host matches and whose text occurs in the command line; anything else succeeds
/// with empty output.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    rules: Mutex<Vec<Rule>>,
    unreachable: Mutex<BTreeSet<String>>,
    failing_writes: Mutex<BTreeSet<String>>,
    stalls: Mutex<Vec<(String, Duration)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, host: Option<&str>, needle: &str, reply: Result<CommandOutput, TransportError>) {
        self.rules.lock().unwrap().push(Rule {
            host: host.map(str::to_string),
            needle: needle.to_string(),
            reply,
        });
    }

    /// Answer commands on `host` containing `needle` with `stdout` and a zero exit code.
    pub fn respond(&self, host: &str, needle: &str, stdout: &str) {
        self.add_rule(
            Some(host),
            needle,
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        );
    }

    /// Like [`MockTransport::respond`], for every host.
    pub fn respond_all(&self, needle: &str, stdout: &str) {
        self.add_rule(
            None,
            needle,
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        );
    }

    /// Make commands on `host` containing `needle` exit with `exit_code`.
    pub fn fail(&self, host: &str, needle: &str, exit_code: i32, stderr: &str) {
        self.add_rule(
            Some(host),
            needle,
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            }),
        );
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    pub fn fail_writes(&self, host: &str) {
        self.failing_writes.lock().unwrap().insert(host.to_string());
    }

    /// Hold back the answer to commands containing `needle` for `delay`.
    pub fn stall(&self, needle: &str, delay: Duration) {
        self.stalls
            .lock()
            .unwrap()
            .push((needle.to_string(), delay));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Command lines run on `host`, in order.
    pub fn executed(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute { host: h, command } if h == host => Some(command.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(String, FileWrite)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write { host, file } => Some((host, file)),
                Call::Execute { .. } => None,
            })
            .collect()
    }

    fn is_unreachable(&self, host: &str) -> Option<TransportError> {
        self.unreachable
            .lock()
            .unwrap()
            .contains(host)
            .then(|| TransportError::Unreachable {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

impl Transport for MockTransport {
    async fn execute(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, TransportError> {
        self.calls.lock().unwrap().push(Call::Execute {
            host: host.to_string(),
            command: command.clone(),
        });
        if let Some(e) = self.is_unreachable(host) {
            return Err(e);
        }

        let line = command.to_string();
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.host.as_deref().map_or(true, |h| h == host) && line.contains(&r.needle))
            .map(|r| r.reply.clone());
        let delay = self
            .stalls
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| line.contains(needle))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply.unwrap_or_else(|| Ok(CommandOutput::default()))
    }

    async fn write_file(&self, host: &str, file: &FileWrite) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Write {
            host: host.to_string(),
            file: file.clone(),
        });
        if let Some(e) = self.is_unreachable(host) {
            return Err(e);
        }
        if self.failing_writes.lock().unwrap().contains(host) {
            return Err(TransportError::Write {
                host: host.to_string(),
                path: file.path(),
                reason: "No space left on device".to_string(),
            });
        }
        Ok(())
    }
}

pub const ALPHA: &str = "alpha";
pub const BETA: &str = "beta";

/// Two hosts with `/dev/sdb`, `/dev/sdc` and `/dev/sdd` each, and resource `r0` with volume 0
/// on `/dev/sdb` of both, as `/dev/drbd0`.
pub fn two_host_topology(version: DrbdVersion) -> Topology {
    let mut topology = Topology::new();
    for name in [ALPHA, BETA] {
        let mut host = Host::new(name, Some(22));
        host.version = Some(version);
        for dev in ["/dev/sdb", "/dev/sdc", "/dev/sdd"] {
            host.block_devices
                .insert(dev.to_string(), BlockDevice::new(dev));
        }
        topology.add_host(host).unwrap();
    }
    topology
        .add_resource("r0", bindings(&[(ALPHA, "10.0.0.1"), (BETA, "10.0.0.2")]))
        .unwrap();
    topology
        .add_volume("r0", &[(ALPHA, "/dev/sdb"), (BETA, "/dev/sdb")], "/dev/drbd0")
        .unwrap();
    topology
}

/// Plain address bindings on port 7788.
pub fn bindings(hosts: &[(&str, &str)]) -> std::collections::BTreeMap<String, HostBinding> {
    hosts
        .iter()
        .map(|(host, ip)| {
            (
                host.to_string(),
                HostBinding {
                    address: Some(Address::new(ip, 7788)),
                    proxy: None,
                },
            )
        })
        .collect()
}

pub fn endpoint(resource: &str, volume: u32, host: &str) -> EndpointId {
    EndpointId::new(VolumeId::new(resource, volume), host)
}

pub fn mock_cluster(topology: Topology) -> Cluster<MockTransport> {
    cluster_with_crm(topology, Box::new(NoCrm))
}

pub fn crm_cluster(topology: Topology, crm_resources: &[&str]) -> Cluster<MockTransport> {
    let crm = StaticCrm::new(crm_resources.iter().map(|r| r.to_string()));
    cluster_with_crm(topology, Box::new(crm))
}

fn cluster_with_crm(topology: Topology, crm: Box<dyn Crm>) -> Cluster<MockTransport> {
    let settings = EngineSettings {
        command_timeout: 5,
        ..Default::default()
    };
    Cluster::new(topology, MockTransport::new(), crm, settings)
}

/// Connected, up to date, secondary.
pub fn connected() -> DeviceStatus {
    DeviceStatus {
        disk: DiskState::Attached,
        connection: ConnectionState::Connected,
        ..Default::default()
    }
}

pub fn primary() -> DeviceStatus {
    DeviceStatus {
        role: Role::Primary,
        ..connected()
    }
}

pub fn sync_source() -> DeviceStatus {
    DeviceStatus {
        sync: SyncState::SyncSource,
        ..connected()
    }
}

pub fn sync_target() -> DeviceStatus {
    DeviceStatus {
        sync: SyncState::SyncTarget,
        ..connected()
    }
}
