// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use {
    futures::future,
    log::{debug, info, warn},
    thiserror::Error,
};

use crate::{
    config::{Config, ConfigFileError, EngineSettings},
    host::{parse_lsblk, DrbdVersion, Host, ScannedDevice},
    overlay::{HostOutput, OverlayCell, TestOverlay},
    parser::{self, ParseError, ParsedConfig},
    remote::{
        drbdadm, ssh::SshTransport, CommandOutput, Crm, FileWrite, RemoteCommand, StaticCrm,
        Transport, TransportError,
    },
    resource::{EndpointId, VolumeId},
    state::{parse_proc_drbd, DeviceStatus, VolumeStatus},
    topology::{Topology, TopologyError},
};

/// Cluster is the model used to represent the dynamic state of a cluster in memory, together with
/// the means to reach its hosts.
///
/// Two locks guard it. The topology lock protects the model itself and is only held for short,
/// synchronous sections. The reconciliation lock serializes everything that changes the
/// configuration or the kernel state of the hosts; it is held across the remote round-trips of
/// one such operation. Status polls and reads need neither.
pub struct Cluster<T: Transport> {
    topology: Mutex<Topology>,
    pub(crate) reconcile_lock: tokio::sync::Mutex<()>,
    pub(crate) overlay: OverlayCell,
    pub(crate) transport: T,
    crm: Box<dyn Crm>,
    pub settings: EngineSettings,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{host}: '{command}' failed: {output}")]
    Command {
        host: String,
        command: String,
        output: String,
    },

    #[error("{host}: {source}")]
    Parse { host: String, source: ParseError },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// What one host reported during discovery.
struct Scan {
    version: Option<DrbdVersion>,
    drbd_loaded: bool,
    devices: Vec<ScannedDevice>,
    config: Option<ParsedConfig>,
}

impl From<Result<CommandOutput, TransportError>> for HostOutput {
    fn from(result: Result<CommandOutput, TransportError>) -> Self {
        match result {
            Ok(out) => HostOutput {
                output: out.combined(),
                exit_code: Some(out.exit_code),
                error: None,
            },
            Err(e) => HostOutput {
                output: String::new(),
                exit_code: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl Cluster<SshTransport> {
    /// Create a cluster reached over ssh from the cluster file at `path`, or the default path.
    pub fn from_config(path: Option<String>) -> Result<Self, ConfigFileError> {
        let path = match path {
            Some(path) => path,
            None => crate::default_config_path(),
        };
        let config = Config::load(&path)?;
        let topology = config.to_topology()?;

        let mut transport = SshTransport::new(config.engine.ssh_user.clone());
        for host in topology.hosts() {
            transport.set_port(host.name(), host.port());
        }
        let crm = StaticCrm::new(config.crm_resources.iter().cloned());
        Ok(Self::new(topology, transport, Box::new(crm), config.engine))
    }
}

impl<T: Transport> Cluster<T> {
    pub fn new(
        topology: Topology,
        transport: T,
        crm: Box<dyn Crm>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            topology: Mutex::new(topology),
            reconcile_lock: tokio::sync::Mutex::new(()),
            overlay: OverlayCell::default(),
            transport,
            crm,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `f` against the current model.
    pub fn read<R>(&self, f: impl FnOnce(&Topology) -> R) -> R {
        f(&self.topology.lock().unwrap())
    }

    /// A copy of the current model, for work that outlives the topology lock.
    pub fn snapshot(&self) -> Topology {
        self.read(Topology::clone)
    }

    /// Run a mutation of the model. A rejected mutation leaves the model untouched.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Topology) -> Result<R, TopologyError>,
    ) -> Result<R, TopologyError> {
        let mut topology = self.topology.lock().unwrap();
        let mut scratch = topology.clone();
        let result = f(&mut scratch);
        match &result {
            Ok(_) => *topology = scratch,
            Err(e) => warn!("rejected change to the cluster: {e}"),
        }
        result
    }

    pub fn is_resource_used_by_crm(&self, resource: &str) -> bool {
        self.crm.is_resource_used_by_crm(resource)
    }

    pub fn endpoint_status(&self, id: &EndpointId) -> Option<DeviceStatus> {
        self.read(|t| t.endpoint_status(id).cloned())
    }

    pub fn volume_status(&self, id: &VolumeId) -> Option<VolumeStatus> {
        self.read(|t| t.volume_status(id))
    }

    /// The status of an endpoint as the last dry-run predicts it, or the real status when no
    /// dry-run is active.
    pub fn predicted_status(&self, id: &EndpointId) -> Option<DeviceStatus> {
        let current = self.endpoint_status(id)?;
        Some(match self.overlay.get() {
            Some(overlay) => overlay.predicted_status(&id.host, &id.volume.resource, &current),
            None => current,
        })
    }

    /// The overlay of the last dry-run, if test mode is active.
    pub fn overlay(&self) -> Option<Arc<TestOverlay>> {
        self.overlay.get()
    }

    pub fn exit_test_mode(&self) {
        debug!("leaving test mode");
        self.overlay.clear();
    }

    /// Run one command on `host`, bounded by the configured timeout.
    pub(crate) async fn run(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, TransportError> {
        debug!("{host}: {command}");
        let result =
            match tokio::time::timeout(self.settings.timeout(), self.transport.execute(host, command))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    host: host.to_string(),
                    seconds: self.settings.command_timeout,
                }),
            };
        match &result {
            Ok(out) if !out.success() => {
                debug!("{host}: '{command}' exited with {}", out.exit_code)
            }
            Err(e) => warn!("{e}"),
            _ => {}
        }
        result
    }

    pub(crate) async fn write(&self, host: &str, file: &FileWrite) -> Result<(), TransportError> {
        debug!("{host}: writing {}", file.path());
        let result =
            match tokio::time::timeout(self.settings.timeout(), self.transport.write_file(host, file))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    host: host.to_string(),
                    seconds: self.settings.command_timeout,
                }),
            };
        if let Err(e) = &result {
            warn!("{e}");
        }
        result
    }

    /// Poll `/proc/drbd` on every member host and apply the result to the model. Returns the
    /// hosts that could not be polled.
    pub async fn poll_status(&self) -> BTreeMap<String, TransportError> {
        let hosts: Vec<String> = self.read(|t| {
            t.hosts()
                .filter(|h| !h.is_proxy())
                .map(|h| h.name().to_string())
                .collect()
        });
        let command = drbdadm::proc_drbd();
        let polls = hosts.iter().map(|host| self.run(host, &command));
        let results = future::join_all(polls).await;

        let mut failures = BTreeMap::new();
        let mut topology = self.topology.lock().unwrap();
        for (host, result) in hosts.into_iter().zip(results) {
            let reachable = result.is_ok();
            let loaded = result.as_ref().is_ok_and(CommandOutput::success);
            if let Ok(h) = topology.host_mut(&host) {
                h.connected = reachable;
                if reachable {
                    h.drbd_loaded = loaded;
                }
            }
            match result {
                Ok(out) if loaded => {
                    let polled = parse_proc_drbd(&out.stdout);
                    if let Err(e) = topology.apply_status(&host, &polled) {
                        warn!("{host}: {e}");
                    }
                }
                Ok(_) => debug!("{host}: DRBD is not loaded"),
                Err(e) => {
                    failures.insert(host, e);
                }
            }
        }
        failures
    }

    async fn scan(&self, host: &str) -> Result<Scan, DiscoveryError> {
        let version = self.run(host, &drbdadm::version()).await?;
        let loaded = self.run(host, &drbdadm::module_loaded()).await?;

        let lsblk_cmd = drbdadm::lsblk();
        let lsblk = self.run(host, &lsblk_cmd).await?;
        if !lsblk.success() {
            return Err(DiscoveryError::Command {
                host: host.to_string(),
                command: lsblk_cmd.to_string(),
                output: lsblk.combined(),
            });
        }

        // No configuration at all makes `drbdadm dump` fail, which is not an error.
        let dump = self.run(host, &drbdadm::dump_all()).await?;
        let config = if dump.success() {
            Some(
                parser::parse(&dump.stdout).map_err(|source| DiscoveryError::Parse {
                    host: host.to_string(),
                    source,
                })?,
            )
        } else {
            info!("{host}: no existing configuration found");
            None
        };

        Ok(Scan {
            version: DrbdVersion::from_drbdadm_output(&version.stdout),
            drbd_loaded: loaded.success(),
            devices: parse_lsblk(&lsblk.stdout),
            config,
        })
    }

    /// Scan `hosts` and merge what they report into the model: software version, block devices
    /// and the existing configuration. Hosts not yet in the cluster are added.
    pub async fn discover(&self, hosts: &[String]) -> BTreeMap<String, Result<(), DiscoveryError>> {
        let scans = future::join_all(hosts.iter().map(|h| self.scan(h))).await;

        let mut results = BTreeMap::new();
        let mut configs = Vec::new();
        let mut topology = self.topology.lock().unwrap();
        for (host, scan) in hosts.iter().zip(scans) {
            let scan = match scan {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("discovery of {host} failed: {e}");
                    results.insert(host.clone(), Err(e));
                    continue;
                }
            };
            if topology.host(host).is_none() {
                if let Err(e) = topology.add_host(Host::new(host, None)) {
                    results.insert(host.clone(), Err(e.into()));
                    continue;
                }
            }
            if let Ok(h) = topology.host_mut(host) {
                h.connected = true;
                h.drbd_loaded = scan.drbd_loaded;
                if scan.version.is_some() {
                    h.version = scan.version;
                }
                h.refresh_block_devices(scan.devices);
            }
            if let Some(config) = scan.config {
                configs.push((host.clone(), config));
            }
            results.insert(host.clone(), Ok(()));
        }

        // Every host is known before resources spanning them are merged.
        for (host, config) in configs {
            let mut scratch = topology.clone();
            match scratch.merge_discovered(&host, config) {
                Ok(()) => {
                    *topology = scratch;
                    info!("discovered configuration of {host}");
                }
                Err(e) => {
                    warn!("could not merge configuration of {host}: {e}");
                    results.insert(host, Err(e.into()));
                }
            }
        }
        results
    }
}
