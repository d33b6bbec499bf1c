// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The in-memory model of a cluster's replicated storage.
//!
//! Entities live in owned maps and refer to each other by stable identifiers (host name,
//! resource name, volume number) rather than by pointer, so tearing down a volume can never
//! leave a dangling back-reference. The device-path index is maintained incrementally by every
//! mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use {
    log::{debug, warn},
    thiserror::Error,
};

use crate::{
    host::{DeviceUse, Host},
    params::ParameterSet,
    parser::{ParsedConfig, ParsedResource},
    resource::{
        Endpoint, EndpointId, HostBinding, MetaDisk, ReplicatedResource, Volume,
        VolumeId,
    },
    state::{DeviceStatus, VolumeStatus},
};

/// Prefix of device paths handed out by [`Topology::new_volume_device_path`].
pub const DEVICE_PATH_PREFIX: &str = "/dev/drbd";

/// Prefix of resource names handed out by [`Topology::new_resource_name`].
pub const RESOURCE_NAME_PREFIX: &str = "r";

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("host '{0}' already exists")]
    DuplicateHost(String),

    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("resource '{0}' already exists with a different definition")]
    DuplicateResource(String),

    #[error("invalid resource name '{0}'")]
    InvalidResourceName(String),

    #[error("unknown volume {0}")]
    UnknownVolume(VolumeId),

    #[error("resource '{resource}' must span at least two hosts, got {count}")]
    TooFewHosts { resource: String, count: usize },

    #[error("host '{host}' is a proxy and cannot hold volumes of '{resource}'")]
    ProxyAsMember { host: String, resource: String },

    #[error("host '{host}' is not a proxy host")]
    NotAProxy { host: String },

    #[error("host '{host}' is not part of resource '{resource}'")]
    HostNotInResource { host: String, resource: String },

    #[error("volume {volume} has no endpoint on host '{host}'")]
    MissingEndpoint { volume: VolumeId, host: String },

    #[error("device path '{path}' is already used by {owner}")]
    DuplicateDevicePath { path: String, owner: String },

    #[error("volume {0} already exists")]
    DuplicateVolume(VolumeId),

    #[error("unknown block device '{device}' on host '{host}'")]
    UnknownBlockDevice { host: String, device: String },

    #[error("block device '{device}' on host '{host}' is already in use ({usage})")]
    BlockDeviceInUse {
        host: String,
        device: String,
        usage: String,
    },

    #[error("meta-disk '{device}' index {index} on host '{host}' is already in use")]
    MetaDiskIndexInUse {
        host: String,
        device: String,
        index: u32,
    },
}

type Result<T> = std::result::Result<T, TopologyError>;

/// The topology of one cluster: hosts with their block devices, and the replicated resources
/// spanning them.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    hosts: BTreeMap<String, Host>,
    resources: BTreeMap<String, ReplicatedResource>,

    /// Options of the `global` section.
    pub global: ParameterSet,

    /// Options of the `common` section, inherited by every resource.
    pub common: ParameterSet,

    /// Device path to the volume using it.
    device_index: HashMap<String, VolumeId>,

    /// Device paths handed out to callers that have not created their volume yet.
    reserved_device_paths: BTreeSet<String>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, host: Host) -> Result<()> {
        if self.hosts.contains_key(host.name()) {
            return Err(TopologyError::DuplicateHost(host.name().to_string()));
        }
        self.hosts.insert(host.name().to_string(), host);
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn host_mut(&mut self, name: &str) -> Result<&mut Host> {
        self.hosts
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownHost(name.to_string()))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn resource(&self, name: &str) -> Option<&ReplicatedResource> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ReplicatedResource> {
        self.resources.values()
    }

    /// Mutable access to a resource's parameters.
    pub fn resource_params_mut(&mut self, name: &str) -> Result<&mut ParameterSet> {
        Ok(&mut self.resource_mut(name)?.params)
    }

    fn resource_mut(&mut self, name: &str) -> Result<&mut ReplicatedResource> {
        self.resources
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownResource(name.to_string()))
    }

    pub fn volume(&self, id: &VolumeId) -> Option<&Volume> {
        self.resources.get(&id.resource)?.volume(id.volume)
    }

    fn volume_mut(&mut self, id: &VolumeId) -> Result<&mut Volume> {
        self.resources
            .get_mut(&id.resource)
            .and_then(|r| r.volumes.get_mut(&id.volume))
            .ok_or_else(|| TopologyError::UnknownVolume(id.clone()))
    }

    pub fn endpoint(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.volume(&id.volume)?.endpoint(&id.host)
    }

    /// The volume currently using `path`, if any.
    pub fn volume_by_device_path(&self, path: &str) -> Option<&VolumeId> {
        self.device_index.get(path)
    }

    /// The other endpoints of the same volume.
    pub fn peers(&self, id: &EndpointId) -> Vec<EndpointId> {
        self.volume(&id.volume)
            .map(|v| {
                v.endpoints()
                    .filter(|(host, _)| *host != id.host)
                    .map(|(host, _)| EndpointId::new(id.volume.clone(), host))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The status of the block device backing an endpoint.
    pub fn endpoint_status(&self, id: &EndpointId) -> Option<&DeviceStatus> {
        let endpoint = self.endpoint(id)?;
        Some(
            self.hosts
                .get(&id.host)?
                .block_device(&endpoint.block_device)?
                .status(),
        )
    }

    pub fn volume_status(&self, id: &VolumeId) -> Option<VolumeStatus> {
        let volume = self.volume(id)?;
        let members = volume
            .endpoints()
            .filter_map(|(host, _)| self.endpoint_status(&EndpointId::new(id.clone(), host)))
            .cloned()
            .collect();
        Some(VolumeStatus::new(members))
    }

    /// Validate the hosts of a resource: at least two members, members are real hosts and not
    /// proxies, proxies named in bindings are proxy hosts.
    fn check_bindings(&self, name: &str, bindings: &BTreeMap<String, HostBinding>) -> Result<()> {
        if bindings.len() < 2 {
            return Err(TopologyError::TooFewHosts {
                resource: name.to_string(),
                count: bindings.len(),
            });
        }
        for (host, binding) in bindings.iter() {
            let member = self
                .hosts
                .get(host)
                .ok_or_else(|| TopologyError::UnknownHost(host.clone()))?;
            if member.is_proxy() {
                return Err(TopologyError::ProxyAsMember {
                    host: host.clone(),
                    resource: name.to_string(),
                });
            }
            if let Some(proxy) = &binding.proxy {
                let relay = self
                    .hosts
                    .get(&proxy.host)
                    .ok_or_else(|| TopologyError::UnknownHost(proxy.host.clone()))?;
                if !relay.is_proxy() {
                    return Err(TopologyError::NotAProxy {
                        host: proxy.host.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Create a resource spanning the hosts in `bindings`.
    ///
    /// Re-adding a resource with an identical definition is a no-op; re-adding it with different
    /// bindings is an error (use [`Topology::update_resource_bindings`] for that).
    pub fn add_resource(
        &mut self,
        name: &str,
        bindings: BTreeMap<String, HostBinding>,
    ) -> Result<()> {
        if !is_valid_resource_name(name) {
            return Err(TopologyError::InvalidResourceName(name.to_string()));
        }
        if let Some(existing) = self.resources.get(name) {
            return if existing.hosts == bindings {
                Ok(())
            } else {
                Err(TopologyError::DuplicateResource(name.to_string()))
            };
        }
        self.check_bindings(name, &bindings)?;
        debug!("adding resource {name}");
        self.resources
            .insert(name.to_string(), ReplicatedResource::new(name, bindings));
        Ok(())
    }

    /// Replace the host bindings of an existing resource. Every host holding an endpoint must
    /// remain part of the resource.
    pub fn update_resource_bindings(
        &mut self,
        name: &str,
        bindings: BTreeMap<String, HostBinding>,
    ) -> Result<()> {
        self.check_bindings(name, &bindings)?;
        let resource = self.resource_mut(name)?;
        for volume in resource.volumes.values() {
            if let Some((host, _)) = volume
                .endpoints()
                .find(|(host, _)| !bindings.contains_key(*host))
            {
                return Err(TopologyError::HostNotInResource {
                    host: host.to_string(),
                    resource: name.to_string(),
                });
            }
        }
        resource.hosts = bindings;
        Ok(())
    }

    /// Remove a resource together with its volumes, releasing every block device they used.
    pub fn remove_resource(&mut self, name: &str) -> Result<ReplicatedResource> {
        let numbers: Vec<u32> = self
            .resource(name)
            .ok_or_else(|| TopologyError::UnknownResource(name.to_string()))?
            .volumes()
            .map(|v| v.number())
            .collect();
        for number in numbers {
            self.release_volume(&VolumeId::new(name, number))?;
        }
        debug!("removing resource {name}");
        self.resource_mut(name)?.volumes.clear();
        self.resources
            .remove(name)
            .ok_or_else(|| TopologyError::UnknownResource(name.to_string()))
    }

    /// Create a volume in `resource` with one endpoint per host of the resource, allocating the
    /// lowest free volume number.
    ///
    /// If a volume of the same resource already uses `device_path` with the same endpoints, its id
    /// is returned and nothing changes.
    pub fn add_volume(
        &mut self,
        resource: &str,
        endpoints: &[(&str, &str)],
        device_path: &str,
    ) -> Result<VolumeId> {
        let res = self
            .resource(resource)
            .ok_or_else(|| TopologyError::UnknownResource(resource.to_string()))?;
        let number = (0..)
            .find(|n| res.volume(*n).is_none())
            .unwrap_or_default();
        self.add_volume_at(resource, number, endpoints, device_path)
    }

    /// Like [`Topology::add_volume`], with an explicit volume number.
    pub fn add_volume_at(
        &mut self,
        resource: &str,
        number: u32,
        endpoints: &[(&str, &str)],
        device_path: &str,
    ) -> Result<VolumeId> {
        let res = self
            .resource(resource)
            .ok_or_else(|| TopologyError::UnknownResource(resource.to_string()))?;

        if let Some(owner) = self.device_index.get(device_path) {
            let same = owner.resource == resource
                && self.volume(owner).is_some_and(|v| {
                    v.endpoints.len() == endpoints.len()
                        && endpoints
                            .iter()
                            .all(|(h, d)| v.endpoint(h).is_some_and(|e| e.block_device == *d))
                });
            return if same {
                Ok(owner.clone())
            } else {
                Err(TopologyError::DuplicateDevicePath {
                    path: device_path.to_string(),
                    owner: owner.to_string(),
                })
            };
        }

        let id = VolumeId::new(resource, number);
        if res.volume(number).is_some() {
            return Err(TopologyError::DuplicateVolume(id));
        }
        for host in res.hosts() {
            if !endpoints.iter().any(|(h, _)| *h == host) {
                return Err(TopologyError::MissingEndpoint {
                    volume: id,
                    host: host.to_string(),
                });
            }
        }
        for (host, device) in endpoints {
            if !res.spans(host) {
                return Err(TopologyError::HostNotInResource {
                    host: host.to_string(),
                    resource: resource.to_string(),
                });
            }
            self.check_free_for_data(host, device, &id)?;
        }

        debug!("adding volume {id} on {device_path}");
        let mut volume = Volume::new(number, Some(device_path.to_string()));
        for (host, device) in endpoints {
            volume
                .endpoints
                .insert(host.to_string(), Endpoint::new(device));
            self.set_usage(host, device, DeviceUse::Data(id.clone()))?;
        }
        self.resource_mut(resource)?.volumes.insert(number, volume);
        self.device_index
            .insert(device_path.to_string(), id.clone());
        self.reserved_device_paths.remove(device_path);
        Ok(id)
    }

    /// Remove a volume and release its block devices. When it was the last volume of its
    /// resource, the resource is removed as well and `true` is returned.
    pub fn remove_volume(&mut self, id: &VolumeId) -> Result<bool> {
        self.release_volume(id)?;
        let resource = self.resource_mut(&id.resource)?;
        resource.volumes.remove(&id.volume);
        debug!("removed volume {id}");
        if resource.volumes.is_empty() {
            self.resources.remove(&id.resource);
            debug!("removed resource {} with its last volume", id.resource);
            return Ok(true);
        }
        Ok(false)
    }

    /// Free the block devices and the device path of a volume without removing it.
    fn release_volume(&mut self, id: &VolumeId) -> Result<()> {
        let volume = self
            .volume(id)
            .ok_or_else(|| TopologyError::UnknownVolume(id.clone()))?
            .clone();
        for (host, endpoint) in volume.endpoints() {
            self.set_usage(host, &endpoint.block_device, DeviceUse::Free)?;
            self.release_meta_disk(host, &endpoint.meta_disk, id);
        }
        if let Some(path) = &volume.device_path {
            self.device_index.remove(path);
        }
        Ok(())
    }

    /// Bind a (different) block device to a volume's endpoint on `endpoint.host`.
    pub fn bind_block_device(&mut self, endpoint: &EndpointId, device: &str) -> Result<()> {
        let current = self
            .endpoint(endpoint)
            .ok_or_else(|| TopologyError::MissingEndpoint {
                volume: endpoint.volume.clone(),
                host: endpoint.host.clone(),
            })?
            .block_device
            .clone();
        if current == device {
            return Ok(());
        }
        self.check_free_for_data(&endpoint.host, device, &endpoint.volume)?;

        self.set_usage(&endpoint.host, &current, DeviceUse::Free)?;
        self.set_usage(
            &endpoint.host,
            device,
            DeviceUse::Data(endpoint.volume.clone()),
        )?;
        let volume = self.volume_mut(&endpoint.volume)?;
        if let Some(e) = volume.endpoints.get_mut(&endpoint.host) {
            e.block_device = device.to_string();
        }
        Ok(())
    }

    /// Set where the meta-data of an endpoint lives. An external meta-disk must be a device that
    /// is not backing any volume, and its index must not be taken by another volume.
    pub fn set_meta_disk(&mut self, endpoint: &EndpointId, meta_disk: MetaDisk) -> Result<()> {
        let current = self
            .endpoint(endpoint)
            .ok_or_else(|| TopologyError::MissingEndpoint {
                volume: endpoint.volume.clone(),
                host: endpoint.host.clone(),
            })?
            .meta_disk
            .clone();
        if current == meta_disk {
            return Ok(());
        }

        if let MetaDisk::External { device, index } = &meta_disk {
            let host = self
                .hosts
                .get(&endpoint.host)
                .ok_or_else(|| TopologyError::UnknownHost(endpoint.host.clone()))?;
            let dev = host
                .block_device(device)
                .ok_or_else(|| TopologyError::UnknownBlockDevice {
                    host: endpoint.host.clone(),
                    device: device.clone(),
                })?;
            if let DeviceUse::Data(owner) = dev.usage() {
                return Err(TopologyError::BlockDeviceInUse {
                    host: endpoint.host.clone(),
                    device: device.clone(),
                    usage: format!("data disk of {owner}"),
                });
            }
            if let DeviceUse::MetaDisk(users) = dev.usage() {
                let taken = users.iter().filter(|u| **u != endpoint.volume).any(|u| {
                    match self.endpoint(&EndpointId::new(u.clone(), &endpoint.host)) {
                        Some(e) => matches!(&e.meta_disk,
                            MetaDisk::External { index: other, .. } if other == index || other.is_none() || index.is_none()),
                        None => false,
                    }
                });
                if taken {
                    return Err(TopologyError::MetaDiskIndexInUse {
                        host: endpoint.host.clone(),
                        device: device.clone(),
                        index: index.unwrap_or_default(),
                    });
                }
            }
        }

        self.release_meta_disk(&endpoint.host, &current, &endpoint.volume);
        if let Some(device) = meta_disk.device() {
            let users = match self.hosts[&endpoint.host].block_device(device).map(|d| d.usage()) {
                Some(DeviceUse::MetaDisk(users)) => {
                    let mut users = users.clone();
                    users.insert(endpoint.volume.clone());
                    users
                }
                _ => BTreeSet::from([endpoint.volume.clone()]),
            };
            self.set_usage(&endpoint.host, device, DeviceUse::MetaDisk(users))?;
        }
        let volume = self.volume_mut(&endpoint.volume)?;
        if let Some(e) = volume.endpoints.get_mut(&endpoint.host) {
            e.meta_disk = meta_disk;
        }
        Ok(())
    }

    /// Override the backing disk path written for an endpoint.
    pub fn set_disk_override(&mut self, endpoint: &EndpointId, disk: Option<String>) -> Result<()> {
        let volume = self.volume_mut(&endpoint.volume)?;
        let e = volume
            .endpoints
            .get_mut(&endpoint.host)
            .ok_or_else(|| TopologyError::MissingEndpoint {
                volume: endpoint.volume.clone(),
                host: endpoint.host.clone(),
            })?;
        e.disk_override = disk;
        Ok(())
    }

    fn check_free_for_data(&self, host: &str, device: &str, id: &VolumeId) -> Result<()> {
        let h = self
            .hosts
            .get(host)
            .ok_or_else(|| TopologyError::UnknownHost(host.to_string()))?;
        if h.is_proxy() {
            return Err(TopologyError::ProxyAsMember {
                host: host.to_string(),
                resource: id.resource.clone(),
            });
        }
        let dev = h
            .block_device(device)
            .ok_or_else(|| TopologyError::UnknownBlockDevice {
                host: host.to_string(),
                device: device.to_string(),
            })?;
        let usage = match dev.usage() {
            DeviceUse::Free => return Ok(()),
            DeviceUse::Data(owner) if owner == id => return Ok(()),
            DeviceUse::Data(owner) => format!("data disk of {owner}"),
            DeviceUse::MetaDisk(_) => "meta-disk".to_string(),
        };
        Err(TopologyError::BlockDeviceInUse {
            host: host.to_string(),
            device: device.to_string(),
            usage,
        })
    }

    fn set_usage(&mut self, host: &str, device: &str, usage: DeviceUse) -> Result<()> {
        let dev = self
            .host_mut(host)?
            .block_devices
            .get_mut(device)
            .ok_or_else(|| TopologyError::UnknownBlockDevice {
                host: host.to_string(),
                device: device.to_string(),
            })?;
        dev.usage = usage;
        Ok(())
    }

    fn release_meta_disk(&mut self, host: &str, meta_disk: &MetaDisk, id: &VolumeId) {
        let Some(device) = meta_disk.device() else {
            return;
        };
        let Some(dev) = self
            .hosts
            .get_mut(host)
            .and_then(|h| h.block_devices.get_mut(device))
        else {
            return;
        };
        if let DeviceUse::MetaDisk(users) = &mut dev.usage {
            users.remove(id);
            if users.is_empty() {
                dev.usage = DeviceUse::Free;
            }
        }
    }

    /// The lowest `/dev/drbd<N>` not used by any volume and not reserved. This is a pure
    /// function of the current state: calling it twice without reserving or using the result
    /// returns the same path.
    pub fn new_volume_device_path(&self) -> String {
        (0u32..)
            .map(|n| format!("{DEVICE_PATH_PREFIX}{n}"))
            .find(|path| {
                !self.device_index.contains_key(path) && !self.reserved_device_paths.contains(path)
            })
            .unwrap_or_default()
    }

    /// Provisionally reserve a device path for a volume that is about to be created.
    pub fn reserve_device_path(&mut self, path: &str) -> Result<()> {
        if let Some(owner) = self.device_index.get(path) {
            return Err(TopologyError::DuplicateDevicePath {
                path: path.to_string(),
                owner: owner.to_string(),
            });
        }
        if !self.reserved_device_paths.insert(path.to_string()) {
            return Err(TopologyError::DuplicateDevicePath {
                path: path.to_string(),
                owner: "a pending reservation".to_string(),
            });
        }
        Ok(())
    }

    pub fn release_device_path(&mut self, path: &str) {
        self.reserved_device_paths.remove(path);
    }

    /// One past the highest index among resources named `r<N>`. Other names are ignored.
    pub fn new_resource_index(&self) -> u32 {
        self.resources
            .keys()
            .filter_map(|name| name.strip_prefix(RESOURCE_NAME_PREFIX))
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .map_or(0, |max| max + 1)
    }

    pub fn new_resource_name(&self) -> String {
        format!("{RESOURCE_NAME_PREFIX}{}", self.new_resource_index())
    }

    /// Overwrite the status of the block device behind an endpoint.
    pub fn set_endpoint_status(&mut self, id: &EndpointId, status: DeviceStatus) -> Result<()> {
        let device = self
            .endpoint(id)
            .ok_or_else(|| TopologyError::MissingEndpoint {
                volume: id.volume.clone(),
                host: id.host.clone(),
            })?
            .block_device
            .clone();
        let host = self.host_mut(&id.host)?;
        let name = host.name().to_string();
        let dev = host.block_devices.get_mut(&device).ok_or_else(|| {
            TopologyError::UnknownBlockDevice {
                host: id.host.clone(),
                device: device.clone(),
            }
        })?;
        dev.set_status(&name, status);
        Ok(())
    }

    /// Record that an endpoint has detected (or recovered from) split brain.
    pub fn mark_split_brain(&mut self, id: &EndpointId, split_brain: bool) -> Result<()> {
        let mut status = self
            .endpoint_status(id)
            .cloned()
            .ok_or_else(|| TopologyError::MissingEndpoint {
                volume: id.volume.clone(),
                host: id.host.clone(),
            })?;
        status.split_brain = split_brain;
        self.set_endpoint_status(id, status)
    }

    /// Apply a status poll of `host`, keyed by minor number. Endpoints on the host whose minor is
    /// missing from the poll are unconfigured.
    pub fn apply_status(&mut self, host: &str, polled: &BTreeMap<u32, DeviceStatus>) -> Result<()> {
        let endpoints: Vec<(EndpointId, u32)> = self
            .resources
            .values()
            .flat_map(|r| r.volumes())
            .filter(|v| v.endpoint(host).is_some())
            .filter_map(|v| {
                let minor = v.minor()?;
                let id = self.device_index.get(v.device_path.as_deref()?)?;
                Some((EndpointId::new(id.clone(), host), minor))
            })
            .collect();

        for (id, minor) in endpoints {
            let current = self.endpoint_status(&id).cloned().unwrap_or_default();
            let new = current.merge_poll(polled.get(&minor).cloned().unwrap_or_default());
            self.set_endpoint_status(&id, new)?;
        }

        for minor in polled.keys() {
            let path = format!("{DEVICE_PATH_PREFIX}{minor}");
            if !self.device_index.contains_key(&path) {
                debug!("{host}: ignoring status of unknown device {path}");
            }
        }
        Ok(())
    }

    /// Merge configuration discovered on `host` into the model, matching resources by name and
    /// volumes by number, and updating them in place. Discovered entities count as committed.
    ///
    /// Resources naming hosts outside the cluster are skipped.
    pub fn merge_discovered(&mut self, host: &str, parsed: ParsedConfig) -> Result<()> {
        debug!("merging configuration discovered on {host}");
        self.global = parsed.global;
        self.common = parsed.common;

        for resource in parsed.resources {
            if let Some(unknown) = resource
                .hosts
                .iter()
                .map(|h| h.name.as_str())
                .find(|h| !self.hosts.contains_key(*h))
            {
                warn!(
                    "skipping discovered resource {}: host {unknown} is not part of the cluster",
                    resource.name
                );
                continue;
            }
            self.merge_resource(resource)?;
        }
        Ok(())
    }

    fn merge_resource(&mut self, parsed: ParsedResource) -> Result<()> {
        let name = parsed.name.clone();
        let bindings: BTreeMap<String, HostBinding> = parsed
            .hosts
            .iter()
            .map(|h| {
                (
                    h.name.clone(),
                    HostBinding {
                        address: h.address.clone(),
                        proxy: h.proxy.clone(),
                    },
                )
            })
            .collect();

        if let Some(existing) = self.resources.get(&name) {
            let stale: Vec<VolumeId> = existing
                .volumes()
                .filter(|v| v.endpoints().any(|(h, _)| !bindings.contains_key(h)))
                .map(|v| VolumeId::new(&name, v.number()))
                .collect();
            for id in stale.iter() {
                self.remove_volume_entry(id)?;
            }
            self.update_resource_bindings(&name, bindings)?;
        } else {
            self.add_resource(&name, bindings)?;
        }
        self.resource_mut(&name)?.params = parsed.params.clone();

        for volume in parsed.volumes() {
            let id = VolumeId::new(&name, volume.number);
            let Some(device_path) = volume.device.clone() else {
                warn!("skipping discovered volume {id} without a device");
                continue;
            };

            for (host, ep) in volume.endpoints.iter() {
                let h = self.host_mut(host)?;
                if h.block_device(&ep.disk).is_none() {
                    h.block_devices.insert(
                        ep.disk.clone(),
                        crate::host::BlockDevice::new(&ep.disk),
                    );
                }
                if let Some(meta) = ep.meta_disk.device() {
                    if h.block_device(meta).is_none() {
                        h.block_devices
                            .insert(meta.to_string(), crate::host::BlockDevice::new(meta));
                    }
                }
            }

            // A volume that moved to another device or host set is rebuilt from scratch.
            let changed = self.volume(&id).is_some_and(|v| {
                v.device_path.as_deref() != Some(device_path.as_str())
                    || v.endpoints.len() != volume.endpoints.len()
                    || volume.endpoints.keys().any(|h| v.endpoint(h).is_none())
            });
            if changed {
                self.remove_volume_entry(&id)?;
            }

            if self.volume(&id).is_none() {
                let endpoints: Vec<(&str, &str)> = volume
                    .endpoints
                    .iter()
                    .map(|(h, e)| (h.as_str(), e.disk.as_str()))
                    .collect();
                self.add_volume_at(&name, volume.number, &endpoints, &device_path)?;
            }
            for (host, ep) in volume.endpoints.iter() {
                let endpoint = EndpointId::new(id.clone(), host);
                self.bind_block_device(&endpoint, &ep.disk)?;
                self.set_meta_disk(&endpoint, ep.meta_disk.clone())?;
            }
        }

        self.resource_mut(&name)?.mark_committed();
        Ok(())
    }

    /// Drop a volume from its resource without the last-volume cascade of
    /// [`Topology::remove_volume`].
    fn remove_volume_entry(&mut self, id: &VolumeId) -> Result<()> {
        self.release_volume(id)?;
        self.resource_mut(&id.resource)?.volumes.remove(&id.volume);
        Ok(())
    }

    /// Mark resources and volumes as committed, and drop reservations for device paths that are
    /// now in use.
    pub fn mark_committed(&mut self) {
        for resource in self.resources.values_mut() {
            resource.mark_committed();
        }
        let index = &self.device_index;
        self.reserved_device_paths
            .retain(|path| !index.contains_key(path));
    }

    /// Like [`Topology::mark_committed`], limited to what `applied` contains. Resources and
    /// volumes added after `applied` was taken stay pending, and so do their reservations.
    pub fn mark_committed_as(&mut self, applied: &Topology) {
        for (name, resource) in self.resources.iter_mut() {
            let Some(pushed) = applied.resources.get(name) else {
                continue;
            };
            resource.committed = true;
            for volume in resource.volumes.values_mut() {
                if pushed
                    .volume(volume.number())
                    .is_some_and(|v| v.device_path == volume.device_path)
                {
                    volume.committed = true;
                }
            }
        }
        let index = &applied.device_index;
        self.reserved_device_paths
            .retain(|path| !index.contains_key(path));
    }
}

fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::BlockDevice, resource::Address};

    fn host(name: &str, devices: &[&str]) -> Host {
        let mut host = Host::new(name, Some(22));
        for dev in devices {
            host.block_devices
                .insert(dev.to_string(), BlockDevice::new(dev));
        }
        host
    }

    fn bindings(hosts: &[&str]) -> BTreeMap<String, HostBinding> {
        hosts
            .iter()
            .enumerate()
            .map(|(i, h)| {
                (
                    h.to_string(),
                    HostBinding {
                        address: Some(Address::new(&format!("10.0.0.{}", i + 1), 7788)),
                        proxy: None,
                    },
                )
            })
            .collect()
    }

    fn topology() -> Topology {
        let mut t = Topology::new();
        t.add_host(host("alpha", &["/dev/sdb", "/dev/sdc", "/dev/sdd"]))
            .unwrap();
        t.add_host(host("beta", &["/dev/sdb", "/dev/sdc", "/dev/sdd"]))
            .unwrap();
        t.add_host(host("gamma", &["/dev/sdb"])).unwrap();
        t
    }

    #[test]
    fn resource_needs_two_hosts() {
        let mut t = topology();
        assert_eq!(
            t.add_resource("r0", bindings(&["alpha"])),
            Err(TopologyError::TooFewHosts {
                resource: "r0".to_string(),
                count: 1
            })
        );
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        assert_eq!(
            t.add_resource("r0", bindings(&["alpha", "gamma"])),
            Err(TopologyError::DuplicateResource("r0".to_string()))
        );
        assert!(matches!(
            t.add_resource("bad name", bindings(&["alpha", "beta"])),
            Err(TopologyError::InvalidResourceName(_))
        ));
    }

    #[test]
    fn device_paths_are_unique() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        t.add_resource("r1", bindings(&["alpha", "beta"])).unwrap();

        let id = t
            .add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        assert_eq!(id, VolumeId::new("r0", 0));

        // Re-applying the same volume is a no-op.
        let again = t
            .add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(t.resource("r0").unwrap().volumes().count(), 1);

        assert!(matches!(
            t.add_volume("r1", &[("alpha", "/dev/sdc"), ("beta", "/dev/sdc")], "/dev/drbd0"),
            Err(TopologyError::DuplicateDevicePath { .. })
        ));
        assert_eq!(
            t.add_volume_at("r0", 0, &[("alpha", "/dev/sdc"), ("beta", "/dev/sdc")], "/dev/drbd1"),
            Err(TopologyError::DuplicateVolume(id))
        );
    }

    #[test]
    fn block_device_in_one_volume_only() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        t.add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();

        assert!(matches!(
            t.add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdc")], "/dev/drbd1"),
            Err(TopologyError::BlockDeviceInUse { .. })
        ));
        assert!(matches!(
            t.add_volume("r0", &[("alpha", "/dev/sdc")], "/dev/drbd1"),
            Err(TopologyError::MissingEndpoint { .. })
        ));
    }

    #[test]
    fn meta_disk_cannot_be_data_disk() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        let id = t
            .add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        let ep = EndpointId::new(id.clone(), "alpha");

        let meta = MetaDisk::External {
            device: "/dev/sdd".to_string(),
            index: Some(0),
        };
        t.set_meta_disk(&ep, meta.clone()).unwrap();
        assert!(t.host("alpha").unwrap().block_device("/dev/sdd").unwrap().is_meta_disk());

        // The meta-disk cannot back a second volume.
        assert!(matches!(
            t.add_volume("r0", &[("alpha", "/dev/sdd"), ("beta", "/dev/sdc")], "/dev/drbd1"),
            Err(TopologyError::BlockDeviceInUse { .. })
        ));

        // A data disk cannot become a meta-disk.
        let id1 = t
            .add_volume("r0", &[("alpha", "/dev/sdc"), ("beta", "/dev/sdc")], "/dev/drbd1")
            .unwrap();
        assert!(matches!(
            t.set_meta_disk(
                &EndpointId::new(id1.clone(), "alpha"),
                MetaDisk::External {
                    device: "/dev/sdb".to_string(),
                    index: Some(0)
                }
            ),
            Err(TopologyError::BlockDeviceInUse { .. })
        ));

        // Same meta-disk, same index: refused. Different index: allowed.
        assert!(matches!(
            t.set_meta_disk(&EndpointId::new(id1.clone(), "alpha"), meta),
            Err(TopologyError::MetaDiskIndexInUse { .. })
        ));
        t.set_meta_disk(
            &EndpointId::new(id1, "alpha"),
            MetaDisk::External {
                device: "/dev/sdd".to_string(),
                index: Some(1),
            },
        )
        .unwrap();

        // Removing the volume frees its devices; the meta-disk stays in use by the other one.
        t.remove_volume(&id).unwrap();
        let alpha = t.host("alpha").unwrap();
        assert!(alpha.block_device("/dev/sdb").unwrap().is_free());
        assert!(alpha.block_device("/dev/sdd").unwrap().is_meta_disk());
    }

    #[test]
    fn removing_last_volume_removes_resource() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        let id = t
            .add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        assert_eq!(t.remove_volume(&id), Ok(true));
        assert!(t.resource("r0").is_none());
        assert!(t.volume_by_device_path("/dev/drbd0").is_none());
        assert_eq!(t.new_volume_device_path(), "/dev/drbd0");
    }

    #[test]
    fn rebinding_releases_old_device() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        let id = t
            .add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        t.bind_block_device(&EndpointId::new(id.clone(), "beta"), "/dev/sdc")
            .unwrap();

        let beta = t.host("beta").unwrap();
        assert!(beta.block_device("/dev/sdb").unwrap().is_free());
        assert_eq!(beta.block_device("/dev/sdc").unwrap().data_of(), Some(&id));
    }

    #[test]
    fn device_path_allocation_and_reservation() {
        let mut t = topology();
        assert_eq!(t.new_volume_device_path(), "/dev/drbd0");
        assert_eq!(t.new_volume_device_path(), "/dev/drbd0");

        t.reserve_device_path("/dev/drbd0").unwrap();
        assert_eq!(t.new_volume_device_path(), "/dev/drbd1");
        assert!(t.reserve_device_path("/dev/drbd0").is_err());

        t.release_device_path("/dev/drbd0");
        assert_eq!(t.new_volume_device_path(), "/dev/drbd0");
    }

    #[test]
    fn commit_covers_only_what_was_applied() {
        let mut t = topology();
        t.add_resource("r0", bindings(&["alpha", "beta"])).unwrap();
        t.add_volume("r0", &[("alpha", "/dev/sdb"), ("beta", "/dev/sdb")], "/dev/drbd0")
            .unwrap();
        let applied = t.clone();

        t.add_volume("r0", &[("alpha", "/dev/sdc"), ("beta", "/dev/sdc")], "/dev/drbd1")
            .unwrap();
        t.add_resource("r1", bindings(&["alpha", "beta"])).unwrap();
        t.reserve_device_path("/dev/drbd2").unwrap();
        t.mark_committed_as(&applied);

        let r0 = t.resource("r0").unwrap();
        assert!(r0.committed);
        assert!(r0.volume(0).unwrap().committed);
        assert!(!r0.volume(1).unwrap().committed);
        assert!(!t.resource("r1").unwrap().committed);
        assert_eq!(t.new_volume_device_path(), "/dev/drbd3");
    }

    #[test]
    fn resource_index_honors_naming_pattern() {
        let mut t = topology();
        assert_eq!(t.new_resource_index(), 0);
        t.add_resource("r3", bindings(&["alpha", "beta"])).unwrap();
        t.add_resource("data", bindings(&["alpha", "beta"])).unwrap();
        t.add_resource("r10x", bindings(&["alpha", "beta"])).unwrap();
        assert_eq!(t.new_resource_name(), "r4");
    }

    #[test]
    fn proxy_hosts_cannot_be_members() {
        let mut t = topology();
        t.add_host(Host::new_proxy("relay", Some(22))).unwrap();
        assert!(matches!(
            t.add_resource("r0", bindings(&["alpha", "relay"])),
            Err(TopologyError::ProxyAsMember { .. })
        ));
    }
}
