// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use {log::debug, thiserror::Error};

use crate::{resource::VolumeId, state::DeviceStatus};

/// Version of the DRBD userland tools installed on a host. The version decides which
/// configuration syntax and which drbdadm option syntax the host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DrbdVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid DRBD version '{0}'")]
pub struct VersionParseError(pub String);

#[derive(Debug, Error)]
pub enum HostConfigError {
    #[error("invalid port in host '{0}'")]
    Port(String),

    #[error(transparent)]
    Version(#[from] VersionParseError),
}

impl DrbdVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// DRBD 8.4 introduced multiple volumes per resource.
    pub fn has_volumes(&self) -> bool {
        *self >= Self::new(8, 4, 0)
    }

    /// DRBD 8.3 introduced the `drbd.d/` include directory.
    pub fn has_split_config(&self) -> bool {
        *self >= Self::new(8, 3, 0)
    }

    /// Extract the version from the output of `drbdadm --version`, which prints lines like
    /// `DRBDADM_VERSION=8.4.11`.
    pub fn from_drbdadm_output(output: &str) -> Option<Self> {
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix("DRBDADM_VERSION="))
            .and_then(|v| v.parse().ok())
    }
}

impl Default for DrbdVersion {
    fn default() -> Self {
        Self::new(8, 4, 0)
    }
}

impl FromStr for DrbdVersion {
    type Err = VersionParseError;

    /// Accepts "8.4.11", "8.4" and package style suffixes like "8.4.11-1".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError(s.to_string());
        let core = s.trim().split(['-', '+', ' ']).next().ok_or_else(err)?;
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let major = parts.next().ok_or_else(err)?.map_err(|_| err())?;
        let minor = parts.next().ok_or_else(err)?.map_err(|_| err())?;
        let patch = match parts.next() {
            Some(p) => p.map_err(|_| err())?,
            None => 0,
        };
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for DrbdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How the configuration is laid out on a host's filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayout {
    /// Everything in one `drbd.conf`.
    SingleFile,

    /// A `drbd.conf` that includes `drbd.d/global_common.conf` and one `drbd.d/<res>.res` per
    /// resource.
    SplitDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LvmRole {
    #[default]
    None,

    /// The device is an LVM physical volume.
    PhysicalVolume,

    /// The device is a logical volume carved out of a volume group.
    VolumeGroupMember,
}

/// What a block device is currently used for by the replication subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceUse {
    #[default]
    Free,

    /// Backing disk of exactly one volume.
    Data(VolumeId),

    /// External meta-data device for one or more volumes (each at its own index).
    MetaDisk(BTreeSet<VolumeId>),
}

/// A physical or logical storage unit on a host.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    name: String,
    pub lvm: LvmRole,
    pub mountpoint: Option<String>,
    pub(crate) usage: DeviceUse,
    pub(crate) status: DeviceStatus,
}

impl BlockDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lvm: LvmRole::None,
            mountpoint: None,
            usage: DeviceUse::Free,
            status: DeviceStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> &DeviceUse {
        &self.usage
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }

    pub fn is_free(&self) -> bool {
        self.usage == DeviceUse::Free
    }

    /// The volume this device backs, if any.
    pub fn data_of(&self) -> Option<&VolumeId> {
        match &self.usage {
            DeviceUse::Data(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_meta_disk(&self) -> bool {
        matches!(self.usage, DeviceUse::MetaDisk(_))
    }

    pub(crate) fn set_status(&mut self, host: &str, status: DeviceStatus) {
        if self.status != status {
            debug!(
                "status of {host}:{} changed from {} to {}",
                self.name, self.status, status
            );
            self.status = status;
        }
    }
}

/// A server that takes part in a cluster, either as a full member holding replicated volumes or
/// as a proxy relay for replication traffic.
#[derive(Debug, Clone)]
pub struct Host {
    name: String,
    port: u16,
    proxy: bool,
    pub connected: bool,

    /// Whether the drbd kernel module is loaded.
    pub drbd_loaded: bool,
    pub version: Option<DrbdVersion>,
    pub(crate) block_devices: BTreeMap<String, BlockDevice>,
}

impl Host {
    pub fn new(name: &str, port: Option<u16>) -> Self {
        Host {
            name: name.to_string(),
            port: match port {
                Some(p) => p,
                None => crate::ssh_port(),
            },
            proxy: false,
            connected: true,
            drbd_loaded: true,
            version: None,
            block_devices: BTreeMap::new(),
        }
    }

    pub fn new_proxy(name: &str, port: Option<u16>) -> Self {
        Host {
            proxy: true,
            ..Host::new(name, port)
        }
    }

    /// Create a Host object from a given config::Host object.
    pub fn from_config(config: &crate::config::Host) -> Result<Self, HostConfigError> {
        let (name, port) = Self::get_host_port(&config.hostname)?;
        let mut host = if config.proxy {
            Host::new_proxy(name, port)
        } else {
            Host::new(name, port)
        };
        host.version = config.version.as_deref().map(str::parse).transpose()?;
        for dev in config.block_devices.iter() {
            host.block_devices
                .insert(dev.clone(), BlockDevice::new(dev));
        }
        Ok(host)
    }

    /// Given a string that may be of the form "<address>:<port number>", split it out into the
    /// address and port number portions.
    fn get_host_port(host_str: &str) -> Result<(&str, Option<u16>), HostConfigError> {
        let mut split = host_str.split(':');
        let host = split.next().unwrap_or(host_str);
        let port = split
            .next()
            .map(|port| port.parse::<u16>())
            .transpose()
            .map_err(|_| HostConfigError::Port(host_str.to_string()))?;
        Ok((host, port))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn version(&self) -> DrbdVersion {
        self.version.unwrap_or_default()
    }

    pub fn config_layout(&self) -> ConfigLayout {
        if self.version().has_split_config() {
            ConfigLayout::SplitDirectory
        } else {
            ConfigLayout::SingleFile
        }
    }

    pub fn block_device(&self, name: &str) -> Option<&BlockDevice> {
        self.block_devices.get(name)
    }

    pub fn block_devices(&self) -> impl Iterator<Item = &BlockDevice> {
        self.block_devices.values()
    }

    /// Replace the scanned attributes of this host's block devices with `scanned`, keeping the
    /// volume bindings and statuses of devices that are still present. Devices that vanished
    /// from the scan are dropped unless they are still bound to a volume.
    pub fn refresh_block_devices(&mut self, scanned: Vec<ScannedDevice>) {
        let mut old = std::mem::take(&mut self.block_devices);
        for dev in scanned {
            let mut entry = old
                .remove(&dev.name)
                .unwrap_or_else(|| BlockDevice::new(&dev.name));
            entry.lvm = dev.lvm;
            entry.mountpoint = dev.mountpoint;
            self.block_devices.insert(dev.name, entry);
        }
        for (name, dev) in old {
            if !dev.is_free() {
                debug!("{}: keeping bound device {name} missing from scan", self.name);
                self.block_devices.insert(name, dev);
            }
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One line of `lsblk -P -p -o NAME,TYPE,FSTYPE,MOUNTPOINT` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDevice {
    pub name: String,
    pub lvm: LvmRole,
    pub mountpoint: Option<String>,
}

/// Parse `lsblk -P` (key="value" pairs) output into scanned devices. Optical drives and the
/// replicated devices themselves are skipped.
pub fn parse_lsblk(output: &str) -> Vec<ScannedDevice> {
    output
        .lines()
        .filter_map(|line| {
            let fields = parse_pairs(line);
            let name = fields.get("NAME")?.to_string();
            let kind = fields.get("TYPE").copied().unwrap_or("");
            if kind == "rom" || name.starts_with("/dev/drbd") {
                return None;
            }
            let lvm = match (kind, fields.get("FSTYPE").copied()) {
                ("lvm", _) => LvmRole::VolumeGroupMember,
                (_, Some("LVM2_member")) => LvmRole::PhysicalVolume,
                _ => LvmRole::None,
            };
            let mountpoint = fields
                .get("MOUNTPOINT")
                .filter(|m| !m.is_empty())
                .map(|m| m.to_string());
            Some(ScannedDevice {
                name,
                lvm,
                mountpoint,
            })
        })
        .collect()
}

fn parse_pairs(line: &str) -> BTreeMap<&str, &str> {
    let mut fields = BTreeMap::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else {
            break;
        };
        fields.insert(key, &after[..end]);
        rest = &after[end + 1..];
    }
    fields
}
