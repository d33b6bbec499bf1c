// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, fmt};

use crate::params::{ParameterSet, Section};

/// Stable identifier of a volume: resource name plus volume number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeId {
    pub resource: String,
    pub volume: u32,
}

impl VolumeId {
    pub fn new(resource: &str, volume: u32) -> Self {
        Self {
            resource: resource.to_string(),
            volume,
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.volume)
    }
}

/// Stable identifier of one side of a volume: the volume plus the host holding it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    pub volume: VolumeId,
    pub host: String,
}

impl EndpointId {
    pub fn new(volume: VolumeId, host: &str) -> Self {
        Self {
            volume,
            host: host.to_string(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.volume, self.host)
    }
}

/// Where the DRBD meta-data of a volume lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MetaDisk {
    /// At the end of the backing disk itself.
    #[default]
    Internal,

    /// On a separate device. Without an index, the whole device is used (flexible meta-data).
    External { device: String, index: Option<u32> },
}

impl MetaDisk {
    pub fn device(&self) -> Option<&str> {
        match self {
            MetaDisk::Internal => None,
            MetaDisk::External { device, .. } => Some(device),
        }
    }

    /// Parse the argument of a `meta-disk` statement: `internal`, `<path>` or `<path>[<index>]`
    /// (the index may be written as a separate word).
    pub fn parse(words: &[&str]) -> Option<Self> {
        let joined = words.concat();
        if joined == "internal" {
            return Some(MetaDisk::Internal);
        }
        match joined.split_once('[') {
            Some((device, index)) => Some(MetaDisk::External {
                device: device.trim().to_string(),
                index: Some(index.trim().strip_suffix(']')?.trim().parse().ok()?),
            }),
            None if !joined.is_empty() => Some(MetaDisk::External {
                device: joined,
                index: None,
            }),
            None => None,
        }
    }
}

impl fmt::Display for MetaDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaDisk::Internal => write!(f, "internal"),
            MetaDisk::External {
                device,
                index: Some(index),
            } => write!(f, "{device}[{index}]"),
            MetaDisk::External {
                device,
                index: None,
            } => write!(f, "{device}"),
        }
    }
}

/// One host's side of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Name of the BlockDevice on the host backing this endpoint.
    pub block_device: String,

    /// Backing disk path to write into the config instead of the block device name.
    pub disk_override: Option<String>,
    pub meta_disk: MetaDisk,
}

impl Endpoint {
    pub fn new(block_device: &str) -> Self {
        Self {
            block_device: block_device.to_string(),
            disk_override: None,
            meta_disk: MetaDisk::Internal,
        }
    }

    /// The backing disk as it appears in the config.
    pub fn disk(&self) -> &str {
        self.disk_override.as_deref().unwrap_or(&self.block_device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    number: u32,
    pub device_path: Option<String>,
    pub(crate) endpoints: BTreeMap<String, Endpoint>,
    pub committed: bool,
}

impl Volume {
    pub(crate) fn new(number: u32, device_path: Option<String>) -> Self {
        Self {
            number,
            device_path,
            endpoints: BTreeMap::new(),
            committed: false,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn endpoint(&self, host: &str) -> Option<&Endpoint> {
        self.endpoints.get(host)
    }

    /// Endpoints keyed by host name.
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &Endpoint)> {
        self.endpoints.iter().map(|(h, e)| (h.as_str(), e))
    }

    /// The kernel minor number, when the device path is of the form `/dev/drbd<N>`.
    pub fn minor(&self) -> Option<u32> {
        minor_of(self.device_path.as_deref()?)
    }
}

pub fn minor_of(device_path: &str) -> Option<u32> {
    device_path.strip_prefix("/dev/drbd")?.parse().ok()
}

/// A replication endpoint address, e.g. `ipv4 10.0.0.1:7788`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Address family keyword (`ipv4`, `ipv6`, `ssocks`, `sdp`). `None` means ipv4.
    pub family: Option<String>,
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            family: None,
            ip: ip.to_string(),
            port,
        }
    }

    /// Parse the argument of an `address` statement: an optional family followed by `ip:port`,
    /// with IPv6 addresses in brackets.
    pub fn parse(words: &[&str]) -> Option<Self> {
        let (family, addr) = match words {
            [addr] => (None, *addr),
            [family, addr] => (Some(family.to_string()), *addr),
            _ => return None,
        };
        let (ip, port) = addr.rsplit_once(':')?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        Some(Self {
            family: family.filter(|f| f != "ipv4"),
            ip: ip.to_string(),
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family.as_deref() {
            Some("ipv6") => write!(f, "ipv6 [{}]:{}", self.ip, self.port),
            Some(family) => write!(f, "{family} {}:{}", self.ip, self.port),
            None => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

/// Replication traffic of a member host relayed through a proxy host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    pub host: String,
    pub inside: Address,
    pub outside: Address,
}

/// Per-host part of a resource: the replication address and an optional proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostBinding {
    pub address: Option<Address>,
    pub proxy: Option<ProxyBinding>,
}

/// A named replication unit, spanning the hosts that hold its volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedResource {
    name: String,
    pub params: ParameterSet,
    pub(crate) hosts: BTreeMap<String, HostBinding>,
    pub(crate) volumes: BTreeMap<u32, Volume>,
    pub committed: bool,
}

impl ReplicatedResource {
    pub(crate) fn new(name: &str, hosts: BTreeMap<String, HostBinding>) -> Self {
        Self {
            name: name.to_string(),
            params: ParameterSet::new(),
            hosts,
            volumes: BTreeMap::new(),
            committed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn host_binding(&self, host: &str) -> Option<&HostBinding> {
        self.hosts.get(host)
    }

    pub fn host_bindings(&self) -> impl Iterator<Item = (&str, &HostBinding)> {
        self.hosts.iter().map(|(h, b)| (h.as_str(), b))
    }

    pub fn spans(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    /// Proxy hosts relaying traffic for this resource.
    pub fn proxy_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .values()
            .filter_map(|b| b.proxy.as_ref().map(|p| p.host.as_str()))
    }

    /// A resource is rendered for a host if it spans the host or the host relays it.
    pub fn is_relevant_to(&self, host: &str) -> bool {
        self.spans(host) || self.proxy_hosts().any(|p| p == host)
    }

    pub fn volume(&self, number: u32) -> Option<&Volume> {
        self.volumes.get(&number)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    /// Whether both sides may be primary at once, set either on the resource or in the common
    /// section.
    pub fn allows_two_primaries(&self, common: &ParameterSet) -> bool {
        self.params.has_flag(Section::Net, "allow-two-primaries")
            || common.has_flag(Section::Net, "allow-two-primaries")
    }

    /// Mark the resource and all of its volumes as committed to the hosts.
    pub fn mark_committed(&mut self) {
        self.committed = true;
        for volume in self.volumes.values_mut() {
            volume.committed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_disk_display() {
        assert_eq!(MetaDisk::Internal.to_string(), "internal");
        let external = MetaDisk::External {
            device: "/dev/sdc1".to_string(),
            index: Some(0),
        };
        assert_eq!(external.to_string(), "/dev/sdc1[0]");

        assert_eq!(MetaDisk::parse(&["internal"]), Some(MetaDisk::Internal));
        assert_eq!(MetaDisk::parse(&["/dev/sdc1", "[0]"]), Some(external));
        assert_eq!(
            MetaDisk::parse(&["/dev/sdc1"]),
            Some(MetaDisk::External {
                device: "/dev/sdc1".to_string(),
                index: None
            })
        );
        assert_eq!(MetaDisk::parse(&["/dev/sdc1[x]"]), None);
    }

    #[test]
    fn address_parsing() {
        let addr = Address::parse(&["10.0.0.1:7788"]).unwrap();
        assert_eq!(addr, Address::new("10.0.0.1", 7788));
        assert_eq!(addr.to_string(), "10.0.0.1:7788");

        let addr = Address::parse(&["ipv4", "10.0.0.1:7788"]).unwrap();
        assert_eq!(addr.family, None);

        let addr = Address::parse(&["ipv6", "[fd00::1]:7789"]).unwrap();
        assert_eq!(addr.ip, "fd00::1");
        assert_eq!(addr.to_string(), "ipv6 [fd00::1]:7789");

        assert!(Address::parse(&["10.0.0.1"]).is_none());
    }

    #[test]
    fn minors() {
        assert_eq!(minor_of("/dev/drbd12"), Some(12));
        assert_eq!(minor_of("/dev/drbd/by-res/r0"), None);
    }
}
