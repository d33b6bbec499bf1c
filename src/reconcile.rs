// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bringing the hosts in line with the model.
//!
//! Every change of the configuration goes through the same sequence under the reconciliation
//! lock: render the configuration of every host, install it in a scratch directory and let
//! `drbdadm -d` tell what it would do, and only when every host agrees swap the live
//! configuration and adjust the kernel state. Failures on hosts are collected, never raised, so
//! the caller always sees the complete picture.

use std::collections::{BTreeMap, BTreeSet};

use {
    futures::future,
    log::{debug, info, warn},
    thiserror::Error,
};

use crate::{
    cluster::Cluster,
    config::EngineSettings,
    host::{ConfigLayout, DrbdVersion},
    operation::{DrbdOperation, OperationError},
    overlay::{HostOutput, TestOverlay},
    remote::{
        drbdadm::{self, Invocation},
        shell_quote, CommandOutput, FileWrite, RemoteCommand, Transport,
    },
    render::{render_all, ConfigError, RenderedConfig},
    resource::{EndpointId, VolumeId},
    topology::{Topology, TopologyError},
};

/// Per-host result of a dry-run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DryRunReport {
    pub outputs: BTreeMap<String, HostOutput>,
}

impl DryRunReport {
    pub fn all_ok(&self) -> bool {
        self.outputs.values().all(HostOutput::is_ok)
    }

    pub fn failed_hosts(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .filter(|(_, out)| !out.is_ok())
            .map(|(host, _)| host.as_str())
    }
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// The model does not render; nothing was sent to any host.
    Rejected(ConfigError),

    /// At least one host refused the dry-run; the live configuration was not touched.
    DryRunFailed(DryRunReport),

    /// The swap or the live adjust failed on at least one host.
    CommitFailed {
        dry_run: DryRunReport,
        commit: BTreeMap<String, HostOutput>,
    },

    Applied {
        dry_run: DryRunReport,
        commit: BTreeMap<String, HostOutput>,
    },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Whether operations that would take service away from the cluster resource manager are
/// allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Normal,
    Advanced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRun {
    pub host: String,
    pub command: RemoteCommand,
    pub output: HostOutput,
}

#[derive(Debug)]
pub enum CommandOutcome {
    Rejected(OperationError),

    /// Every command succeeded.
    Done(Vec<CommandRun>),

    /// The last command failed; the ones after it were not run.
    Failed(Vec<CommandRun>),
}

#[derive(Debug, Error, PartialEq)]
pub enum TeardownError {
    #[error("resource '{0}' is used by the cluster resource manager")]
    UsedByCrm(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Debug)]
pub enum TeardownOutcome {
    Rejected(TeardownError),

    /// The entities were removed from the model. Teardown commands that failed are reported but
    /// do not stop the removal.
    Removed {
        teardown: Vec<CommandRun>,
        commit: ApplyOutcome,
    },
}

/// Locations used by the swap of a split configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPaths {
    pub conf: String,
    pub temp_conf: String,
    pub live_dir: String,
    pub temp_dir: String,
    pub old_dir: String,
}

impl SwapPaths {
    pub fn new(settings: &EngineSettings) -> Self {
        let base = settings.config_dir.trim_end_matches('/');
        let live_dir = format!("{base}/{}", settings.split_dir);
        let conf = format!("{base}/{}", settings.conf_file);
        Self {
            temp_conf: format!("{conf}.temp"),
            temp_dir: format!("{live_dir}.temp"),
            old_dir: format!("{live_dir}.old"),
            conf,
            live_dir,
        }
    }

    /// Move the staged tree and file into place. A crash at any point leaves a state that
    /// [`plan_repair`] can resolve.
    pub fn swap_script(&self) -> String {
        let q = |p: &str| shell_quote(p);
        format!(
            "rm -rf {old} && if [ -e {live} ]; then mv {live} {old}; fi && mv {temp} {live} && mv {temp_conf} {conf} && rm -rf {old}",
            old = q(&self.old_dir),
            live = q(&self.live_dir),
            temp = q(&self.temp_dir),
            temp_conf = q(&self.temp_conf),
            conf = q(&self.conf),
        )
    }

    pub fn repair_script(&self, action: RepairAction) -> Option<String> {
        let old = shell_quote(&self.old_dir);
        let live = shell_quote(&self.live_dir);
        let temp = shell_quote(&self.temp_dir);
        let temp_conf = shell_quote(&self.temp_conf);
        let conf = shell_quote(&self.conf);
        match action {
            RepairAction::Nothing => None,
            RepairAction::RollBack => Some(format!(
                "rm -rf {temp} && mv {old} {live} && rm -f {temp_conf}"
            )),
            RepairAction::RollForward => Some(format!("mv {temp_conf} {conf} && rm -rf {old}")),
            RepairAction::DiscardStaging => {
                Some(format!("rm -rf {temp} {old} && rm -f {temp_conf}"))
            }
        }
    }

    fn probe(&self) -> RemoteCommand {
        drbdadm::probe_paths(&[
            self.live_dir.clone(),
            self.old_dir.clone(),
            self.temp_dir.clone(),
            self.temp_conf.clone(),
        ])
    }

    fn read_probe(&self, output: &str) -> SwapProbe {
        let found: BTreeSet<&str> = output.lines().map(str::trim).collect();
        SwapProbe {
            live_dir: found.contains(self.live_dir.as_str()),
            old_dir: found.contains(self.old_dir.as_str()),
            temp_dir: found.contains(self.temp_dir.as_str()),
            temp_conf: found.contains(self.temp_conf.as_str()),
        }
    }
}

/// Which artefacts of the swap exist on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapProbe {
    pub live_dir: bool,
    pub old_dir: bool,
    pub temp_dir: bool,
    pub temp_conf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Nothing,

    /// The old tree was moved aside but the new one never moved in: restore the old one.
    RollBack,

    /// The new tree is in place, only the top-level file is missing: finish the swap.
    RollForward,

    /// Leftovers of a swap that either never started or already completed.
    DiscardStaging,
}

pub fn plan_repair(probe: &SwapProbe) -> RepairAction {
    if probe.old_dir && !probe.live_dir {
        RepairAction::RollBack
    } else if probe.temp_conf && !probe.temp_dir && probe.live_dir {
        RepairAction::RollForward
    } else if probe.old_dir || probe.temp_dir || probe.temp_conf {
        RepairAction::DiscardStaging
    } else {
        RepairAction::Nothing
    }
}

/// Split a path relative to `base` into the directory and file name a [`FileWrite`] wants.
fn place(base: &str, relative: &str) -> (String, String) {
    let base = base.trim_end_matches('/');
    match relative.rsplit_once('/') {
        Some((sub, name)) => (format!("{base}/{sub}"), name.to_string()),
        None => (base.to_string(), relative.to_string()),
    }
}

struct HostPlan<'a> {
    config: &'a RenderedConfig,
    version: DrbdVersion,
    proxy: bool,
}

fn host_plans<'a>(
    topology: &Topology,
    rendered: &'a BTreeMap<String, RenderedConfig>,
) -> Vec<HostPlan<'a>> {
    rendered
        .values()
        .map(|config| {
            let host = topology.host(&config.host);
            HostPlan {
                config,
                version: host.map(|h| h.version()).unwrap_or_default(),
                proxy: host.is_some_and(|h| h.is_proxy()),
            }
        })
        .collect()
}

impl<T: Transport> Cluster<T> {
    /// Render the configuration of every host without touching any of them.
    pub fn plan(&self) -> Result<BTreeMap<String, RenderedConfig>, ConfigError> {
        let paths = self.settings.render_paths();
        self.read(|t| render_all(t, &paths))
    }

    /// Run `command` and turn anything but a clean exit into the output to report.
    async fn checked(&self, host: &str, command: &RemoteCommand) -> Result<(), HostOutput> {
        match self.run(host, command).await {
            Ok(out) if out.success() => Ok(()),
            other => Err(other.into()),
        }
    }

    async fn write_checked(&self, host: &str, file: &FileWrite) -> Result<(), HostOutput> {
        self.write(host, file)
            .await
            .map_err(|e| HostOutput::from(Err::<CommandOutput, _>(e)))
    }

    async fn dry_run_host(&self, plan: &HostPlan<'_>) -> HostOutput {
        let host = plan.config.host.as_str();
        let dir = self.settings.dry_run_dir.trim_end_matches('/');
        let prepare = RemoteCommand::shell(&format!(
            "rm -rf {d} && mkdir -p {d}",
            d = shell_quote(dir)
        ));
        if let Err(failed) = self.checked(host, &prepare).await {
            return failed;
        }
        for file in plan.config.files.iter() {
            let (directory, filename) = place(dir, &file.path);
            let write = FileWrite::new(&directory, &filename, &file.content);
            if let Err(failed) = self.write_checked(host, &write).await {
                return failed;
            }
        }

        let conf = format!("{dir}/{}", self.settings.conf_file);
        let invocation = Invocation::dry_run(Some(conf.as_str()));
        let adjust = drbdadm::adjust_all(plan.version, &invocation, plan.proxy);
        self.run(host, &adjust).await.into()
    }

    /// The dry-run proper; the caller holds the reconciliation lock. Returns what was rendered
    /// so a following commit installs exactly what was tested.
    async fn dry_run_locked(
        &self,
    ) -> Result<(DryRunReport, BTreeMap<String, RenderedConfig>, Topology), ConfigError> {
        let snapshot = self.snapshot();
        let rendered = render_all(&snapshot, &self.settings.render_paths()).inspect_err(|e| {
            warn!("configuration does not render, nothing sent: {e}");
        })?;

        let plans = host_plans(&snapshot, &rendered);
        let outputs = future::join_all(plans.iter().map(|p| self.dry_run_host(p))).await;
        let report = DryRunReport {
            outputs: plans
                .iter()
                .map(|p| p.config.host.clone())
                .zip(outputs)
                .collect(),
        };

        for host in report.failed_hosts() {
            warn!("dry-run failed on {host}");
        }
        if report.all_ok() {
            info!("dry-run succeeded on {} hosts", report.outputs.len());
        }
        self.overlay
            .replace(TestOverlay::build(&snapshot, report.outputs.clone()));
        Ok((report, rendered, snapshot))
    }

    /// Evaluate the current model on every host with `drbdadm -d` and record the predicted
    /// effect in the overlay. Only configuration errors are returned as `Err`.
    pub async fn create_config_dry_run(&self) -> Result<DryRunReport, ConfigError> {
        let _guard = self.reconcile_lock.lock().await;
        let (report, _, _) = self.dry_run_locked().await?;
        Ok(report)
    }

    /// Install a host's configuration in place of the live one.
    async fn swap_in(&self, config: &RenderedConfig) -> Result<(), HostOutput> {
        let host = config.host.as_str();
        let base = self.settings.config_dir.as_str();
        match config.layout {
            ConfigLayout::SingleFile => {
                for file in config.files.iter() {
                    let (directory, filename) = place(base, &file.path);
                    let mut write = FileWrite::new(&directory, &filename, &file.content);
                    write.make_backup = true;
                    self.write_checked(host, &write).await?;
                }
            }
            ConfigLayout::SplitDirectory => {
                let swap = SwapPaths::new(&self.settings);
                let stage = RemoteCommand::shell(&format!(
                    "rm -rf {t} && mkdir -p {t}",
                    t = shell_quote(&swap.temp_dir)
                ));
                self.checked(host, &stage).await?;

                let split_prefix = format!("{}/", self.settings.split_dir);
                for file in config.files.iter() {
                    let write = match file.path.strip_prefix(&split_prefix) {
                        Some(rest) => {
                            let (directory, filename) = place(&swap.temp_dir, rest);
                            FileWrite::new(&directory, &filename, &file.content)
                        }
                        None => {
                            let (directory, filename) = place(base, &file.path);
                            FileWrite::new(&directory, &format!("{filename}.temp"), &file.content)
                        }
                    };
                    self.write_checked(host, &write).await?;
                }
                self.checked(host, &RemoteCommand::shell(&swap.swap_script()))
                    .await?;
            }
        }
        debug!("{host}: new configuration in place");
        Ok(())
    }

    async fn install_host(&self, plan: &HostPlan<'_>) -> HostOutput {
        if let Err(failed) = self.swap_in(plan.config).await {
            return failed;
        }
        let adjust = drbdadm::adjust_all(plan.version, &Invocation::live(), plan.proxy);
        self.run(&plan.config.host, &adjust).await.into()
    }

    async fn commit_locked(&self) -> ApplyOutcome {
        let (dry_run, rendered, snapshot) = match self.dry_run_locked().await {
            Ok(result) => result,
            Err(e) => return ApplyOutcome::Rejected(e),
        };
        if !dry_run.all_ok() {
            warn!("not committing: dry-run failed");
            return ApplyOutcome::DryRunFailed(dry_run);
        }

        let plans = host_plans(&snapshot, &rendered);
        let outputs = future::join_all(plans.iter().map(|p| self.install_host(p))).await;
        let commit: BTreeMap<String, HostOutput> = plans
            .iter()
            .map(|p| p.config.host.clone())
            .zip(outputs)
            .collect();

        if commit.values().all(HostOutput::is_ok) {
            let _ = self.mutate(|t| {
                t.mark_committed_as(&snapshot);
                Ok(())
            });
            info!("configuration committed on {} hosts", commit.len());
            ApplyOutcome::Applied { dry_run, commit }
        } else {
            for (host, _) in commit.iter().filter(|(_, out)| !out.is_ok()) {
                warn!("commit failed on {host}");
            }
            ApplyOutcome::CommitFailed { dry_run, commit }
        }
    }

    /// Dry-run, then install the configuration on every host and adjust the kernel state. The
    /// live configuration is left alone unless the dry-run succeeded everywhere.
    pub async fn create_drbd_config_live(&self) -> ApplyOutcome {
        let _guard = self.reconcile_lock.lock().await;
        self.commit_locked().await
    }

    /// Resolve swaps of split configurations that were interrupted.
    pub async fn repair(&self) -> BTreeMap<String, Result<RepairAction, HostOutput>> {
        let _guard = self.reconcile_lock.lock().await;
        let swap = SwapPaths::new(&self.settings);
        let hosts: Vec<String> = self.read(|t| {
            t.hosts()
                .filter(|h| h.config_layout() == ConfigLayout::SplitDirectory)
                .map(|h| h.name().to_string())
                .collect()
        });

        let repairs = hosts.iter().map(|host| {
            let swap = &swap;
            async move {
                let probe = match self.run(host, &swap.probe()).await {
                    Ok(out) if out.success() => swap.read_probe(&out.stdout),
                    other => return Err(HostOutput::from(other)),
                };
                let action = plan_repair(&probe);
                if let Some(script) = swap.repair_script(action) {
                    info!("{host}: repairing interrupted swap ({action:?})");
                    self.checked(host, &RemoteCommand::shell(&script)).await?;
                }
                Ok::<_, HostOutput>(action)
            }
        });
        let results = future::join_all(repairs).await;
        hosts.into_iter().zip(results).collect()
    }

    fn plan_operation(
        &self,
        endpoint: &EndpointId,
        op: DrbdOperation,
        mode: AccessMode,
        invocation: &Invocation,
    ) -> Result<Vec<(String, RemoteCommand)>, OperationError> {
        if op.is_destructive()
            && mode == AccessMode::Normal
            && self.is_resource_used_by_crm(&endpoint.volume.resource)
        {
            return Err(OperationError::UsedByCrm {
                operation: op,
                endpoint: endpoint.clone(),
            });
        }

        self.read(|t| {
            let status = t
                .endpoint_status(endpoint)
                .ok_or_else(|| OperationError::UnknownEndpoint(endpoint.clone()))?;
            op.validate(endpoint, status)?;
            let version = |host: &str| t.host(host).map(|h| h.version()).unwrap_or_default();

            let mut plan = Vec::new();
            let two_primaries = t
                .resource(&endpoint.volume.resource)
                .is_some_and(|r| r.allows_two_primaries(&t.common));
            if op == DrbdOperation::SetPrimary && !two_primaries {
                for peer in t.peers(endpoint) {
                    if t.endpoint_status(&peer).is_some_and(|s| s.is_primary()) {
                        debug!("demoting {peer} before promoting {endpoint}");
                        let commands = DrbdOperation::SetSecondary.commands(
                            version(&peer.host),
                            invocation,
                            &peer.volume,
                        );
                        plan.extend(commands.into_iter().map(|c| (peer.host.clone(), c)));
                    }
                }
            }
            let commands = op.commands(version(&endpoint.host), invocation, &endpoint.volume);
            plan.extend(commands.into_iter().map(|c| (endpoint.host.clone(), c)));
            Ok(plan)
        })
    }

    async fn run_operation(
        &self,
        endpoint: &EndpointId,
        op: DrbdOperation,
        mode: AccessMode,
        invocation: &Invocation<'_>,
    ) -> CommandOutcome {
        let plan = match self.plan_operation(endpoint, op, mode, invocation) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("{e}");
                return CommandOutcome::Rejected(e);
            }
        };

        let mut runs = Vec::new();
        for (host, command) in plan {
            let output: HostOutput = self.run(&host, &command).await.into();
            let ok = output.is_ok();
            runs.push(CommandRun {
                host,
                command,
                output,
            });
            if !ok {
                warn!("{op} on {endpoint} failed");
                return CommandOutcome::Failed(runs);
            }
        }
        info!("{op} on {endpoint} done");
        CommandOutcome::Done(runs)
    }

    /// Request `op` on one endpoint. The operation is checked against the last polled status
    /// first; a promotion demotes a primary peer first unless the resource allows two primaries.
    pub async fn apply(
        &self,
        endpoint: &EndpointId,
        op: DrbdOperation,
        mode: AccessMode,
    ) -> CommandOutcome {
        let _guard = self.reconcile_lock.lock().await;
        self.run_operation(endpoint, op, mode, &Invocation::live())
            .await
    }

    /// Like [`Cluster::apply`], but with `drbdadm -d`: the hosts print what they would do.
    pub async fn preview(
        &self,
        endpoint: &EndpointId,
        op: DrbdOperation,
        mode: AccessMode,
    ) -> CommandOutcome {
        self.run_operation(endpoint, op, mode, &Invocation::dry_run(None))
            .await
    }

    async fn teardown(&self, plan: Vec<(String, RemoteCommand)>) -> Vec<CommandRun> {
        let mut runs = Vec::new();
        for (host, command) in plan {
            let output: HostOutput = self.run(&host, &command).await.into();
            if !output.is_ok() {
                warn!("{host}: teardown command '{command}' failed");
            }
            runs.push(CommandRun {
                host,
                command,
                output,
            });
        }
        runs
    }

    /// Tear down a volume on its hosts, drop it from the model and commit the result. Removing
    /// the last volume removes the resource.
    pub async fn remove_volume(&self, id: &VolumeId, mode: AccessMode) -> TeardownOutcome {
        let _guard = self.reconcile_lock.lock().await;
        if mode == AccessMode::Normal && self.is_resource_used_by_crm(&id.resource) {
            return TeardownOutcome::Rejected(TeardownError::UsedByCrm(id.resource.clone()));
        }

        let plan = self.read(|t| -> Result<Vec<(String, RemoteCommand)>, TopologyError> {
            let resource = t
                .resource(&id.resource)
                .ok_or_else(|| TopologyError::UnknownResource(id.resource.clone()))?;
            let volume = resource
                .volume(id.volume)
                .ok_or_else(|| TopologyError::UnknownVolume(id.clone()))?;
            if !volume.committed {
                return Ok(Vec::new());
            }
            let last = resource.volumes().count() == 1;

            let mut plan = Vec::new();
            for (host, _) in volume.endpoints() {
                let version = t.host(host).map(|h| h.version()).unwrap_or_default();
                if last {
                    plan.push((host.to_string(), drbdadm::down(version, &id.resource)));
                    continue;
                }
                plan.push((host.to_string(), drbdadm::detach(version, id)));
                if let Some(minor) = volume.minor() {
                    plan.push((host.to_string(), drbdadm::del_minor(version, minor)));
                }
            }
            Ok(plan)
        });
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => return TeardownOutcome::Rejected(e.into()),
        };

        let teardown = self.teardown(plan).await;
        match self.mutate(|t| t.remove_volume(id)) {
            Ok(true) => info!("removed {id} and its resource"),
            Ok(false) => info!("removed {id}"),
            Err(e) => return TeardownOutcome::Rejected(e.into()),
        }
        let commit = self.commit_locked().await;
        TeardownOutcome::Removed { teardown, commit }
    }

    /// Take a resource down on its hosts, drop it from the model and commit the result.
    pub async fn remove_resource(&self, name: &str, mode: AccessMode) -> TeardownOutcome {
        let _guard = self.reconcile_lock.lock().await;
        if mode == AccessMode::Normal && self.is_resource_used_by_crm(name) {
            return TeardownOutcome::Rejected(TeardownError::UsedByCrm(name.to_string()));
        }

        let plan = self.read(|t| -> Result<Vec<(String, RemoteCommand)>, TopologyError> {
            let resource = t
                .resource(name)
                .ok_or_else(|| TopologyError::UnknownResource(name.to_string()))?;
            if !resource.committed {
                return Ok(Vec::new());
            }
            Ok(resource
                .hosts()
                .filter_map(|h| t.host(h))
                .filter(|h| !h.is_proxy())
                .map(|h| (h.name().to_string(), drbdadm::down(h.version(), name)))
                .collect())
        });
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => return TeardownOutcome::Rejected(e.into()),
        };

        let teardown = self.teardown(plan).await;
        if let Err(e) = self.mutate(|t| t.remove_resource(name)) {
            return TeardownOutcome::Rejected(e.into());
        }
        info!("removed resource {name}");
        let commit = self.commit_locked().await;
        TeardownOutcome::Removed { teardown, commit }
    }

    /// Hand out a device path for a new volume and reserve it until the volume is committed, so
    /// concurrent callers never get the same path.
    pub async fn reserve_new_volume_device_path(&self) -> Result<String, TopologyError> {
        let _guard = self.reconcile_lock.lock().await;
        self.mutate(|t| {
            let path = t.new_volume_device_path();
            t.reserve_device_path(&path)?;
            Ok(path)
        })
    }

    pub async fn new_resource_name(&self) -> String {
        let _guard = self.reconcile_lock.lock().await;
        self.read(Topology::new_resource_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap() -> SwapPaths {
        SwapPaths::new(&EngineSettings::default())
    }

    #[test]
    fn swap_paths() {
        let swap = swap();
        assert_eq!(swap.conf, "/etc/drbd.conf");
        assert_eq!(swap.temp_dir, "/etc/drbd.d.temp");
        assert_eq!(
            swap.swap_script(),
            "rm -rf /etc/drbd.d.old && if [ -e /etc/drbd.d ]; then mv /etc/drbd.d /etc/drbd.d.old; fi \
             && mv /etc/drbd.d.temp /etc/drbd.d && mv /etc/drbd.conf.temp /etc/drbd.conf \
             && rm -rf /etc/drbd.d.old"
        );
    }

    #[test]
    fn repair_decisions() {
        let probe = |live_dir, old_dir, temp_dir, temp_conf| SwapProbe {
            live_dir,
            old_dir,
            temp_dir,
            temp_conf,
        };
        // Crash after moving the old tree aside.
        assert_eq!(plan_repair(&probe(false, true, true, true)), RepairAction::RollBack);
        // Crash between moving the tree in and renaming the file.
        assert_eq!(plan_repair(&probe(true, true, false, true)), RepairAction::RollForward);
        // Crash while staging.
        assert_eq!(plan_repair(&probe(true, false, true, true)), RepairAction::DiscardStaging);
        // Crash before the old tree was removed.
        assert_eq!(plan_repair(&probe(true, true, false, false)), RepairAction::DiscardStaging);
        assert_eq!(plan_repair(&probe(true, false, false, false)), RepairAction::Nothing);
    }

    #[test]
    fn probe_output() {
        let swap = swap();
        let probe = swap.read_probe("/etc/drbd.d\n/etc/drbd.conf.temp\n");
        assert_eq!(
            probe,
            SwapProbe {
                live_dir: true,
                old_dir: false,
                temp_dir: false,
                temp_conf: true,
            }
        );
        assert_eq!(
            swap.repair_script(plan_repair(&probe)).unwrap(),
            "mv /etc/drbd.conf.temp /etc/drbd.conf && rm -rf /etc/drbd.d.old"
        );
    }

    #[test]
    fn placing_relative_paths() {
        assert_eq!(
            place("/etc/", "drbd.d/r0.res"),
            ("/etc/drbd.d".to_string(), "r0.res".to_string())
        );
        assert_eq!(
            place("/etc", "drbd.conf"),
            ("/etc".to_string(), "drbd.conf".to_string())
        );
    }
}
