// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, time::Duration};

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::{
    host::HostConfigError,
    params::{lookup, raw_value, ParamError, ParameterSet, Section},
    render::RenderPaths,
    resource::{Address, EndpointId, HostBinding, MetaDisk, ProxyBinding, VolumeId},
    topology::{Topology, TopologyError},
};

/// Config, along with its children, is the model of a replicated-storage cluster used in the
/// cluster file. The file is deserialized into a Config object and then turned into a
/// [`Topology`].
///
/// The model used in the file is intentionally different from the model used to track the
/// cluster in memory, so the in-memory model can change without changing the file format.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,

    pub hosts: Vec<Host>,

    /// Options of the `global` section, by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,

    /// Options of the `common` section, by section and name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common: BTreeMap<String, BTreeMap<String, String>>,

    #[serde(default)]
    pub resources: Vec<Resource>,

    /// Replicated resources that the cluster resource manager builds on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crm_resources: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding the live configuration.
    pub config_dir: String,
    pub conf_file: String,
    pub split_dir: String,

    /// Scratch directory on each host for dry-run configurations.
    pub dry_run_dir: String,

    /// Seconds to wait for a single remote command.
    pub command_timeout: u64,
    pub ssh_user: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            config_dir: "/etc".to_string(),
            conf_file: "drbd.conf".to_string(),
            split_dir: "drbd.d".to_string(),
            dry_run_dir: "/var/lib/drbd/drbdmgr-test".to_string(),
            command_timeout: 30,
            ssh_user: None,
        }
    }
}

impl EngineSettings {
    pub fn render_paths(&self) -> RenderPaths {
        RenderPaths {
            conf_file: self.conf_file.clone(),
            split_dir: self.split_dir.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Host {
    /// Host name, optionally followed by `:<ssh port>`.
    pub hostname: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub proxy: bool,

    /// Installed DRBD userland version, e.g. "8.4.11".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_devices: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, BTreeMap<String, String>>,

    pub hosts: Vec<ResourceHost>,

    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceHost {
    pub name: String,

    /// `ip:port`, optionally preceded by the address family (`ipv6 [fd00::1]:7788`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Proxy {
    pub host: String,
    pub inside: String,
    pub outside: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Volume {
    pub number: u32,
    pub device: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub disk: String,

    /// Backing disk path written to the configuration instead of `disk`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_override: Option<String>,

    /// `internal`, `<device>` or `<device>[<index>]`.
    #[serde(default = "internal", skip_serializing_if = "is_internal")]
    pub meta_disk: String,
}

fn internal() -> String {
    "internal".to_string()
}

fn is_internal(meta_disk: &str) -> bool {
    meta_disk == "internal"
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Host(#[from] HostConfigError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("invalid {what} '{value}' in resource '{resource}'")]
    Invalid {
        resource: String,
        what: &'static str,
        value: String,
    },
}

fn set_sections(
    params: &mut ParameterSet,
    sections: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<(), ParamError> {
    for (section, values) in sections.iter() {
        let section: Section = section.parse()?;
        for (name, raw) in values.iter() {
            params.set(section, name, raw)?;
        }
    }
    Ok(())
}

fn get_sections(params: &ParameterSet) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (section, name, value) in params.iter() {
        sections
            .entry(section.to_string())
            .or_default()
            .insert(name.to_string(), raw_value(lookup(section, name), value));
    }
    sections
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Build the in-memory topology described by this file. Every invariant of the topology is
    /// checked on the way.
    pub fn to_topology(&self) -> Result<Topology, ConfigFileError> {
        let mut topology = Topology::new();
        for host in self.hosts.iter() {
            topology.add_host(crate::host::Host::from_config(host)?)?;
        }

        for (name, raw) in self.global.iter() {
            topology.global.set(Section::Global, name, raw)?;
        }
        set_sections(&mut topology.common, &self.common)?;

        for res in self.resources.iter() {
            let invalid = |what, value: &str| ConfigFileError::Invalid {
                resource: res.name.clone(),
                what,
                value: value.to_string(),
            };
            let address = |value: &str| {
                let words: Vec<&str> = value.split_whitespace().collect();
                Address::parse(&words).ok_or_else(|| invalid("address", value))
            };

            let mut bindings = BTreeMap::new();
            for host in res.hosts.iter() {
                let proxy = match &host.proxy {
                    Some(p) => Some(ProxyBinding {
                        host: p.host.clone(),
                        inside: address(&p.inside)?,
                        outside: address(&p.outside)?,
                    }),
                    None => None,
                };
                let binding = HostBinding {
                    address: host.address.as_deref().map(address).transpose()?,
                    proxy,
                };
                bindings.insert(host.name.clone(), binding);
            }
            topology.add_resource(&res.name, bindings)?;
            set_sections(topology.resource_params_mut(&res.name)?, &res.params)?;

            for vol in res.volumes.iter() {
                let endpoints: Vec<(&str, &str)> = vol
                    .endpoints
                    .iter()
                    .map(|e| (e.host.as_str(), e.disk.as_str()))
                    .collect();
                topology.add_volume_at(&res.name, vol.number, &endpoints, &vol.device)?;

                for ep in vol.endpoints.iter() {
                    let id = EndpointId::new(VolumeId::new(&res.name, vol.number), &ep.host);
                    let meta_disk = MetaDisk::parse(&[ep.meta_disk.as_str()])
                        .ok_or_else(|| invalid("meta-disk", &ep.meta_disk))?;
                    topology.set_meta_disk(&id, meta_disk)?;
                    topology.set_disk_override(&id, ep.disk_override.clone())?;
                }
            }
        }
        Ok(topology)
    }

    /// Describe `topology` in the file format, e.g. after discovering an existing cluster.
    pub fn from_topology(
        topology: &Topology,
        engine: EngineSettings,
        crm_resources: Vec<String>,
    ) -> Self {
        let hosts = topology
            .hosts()
            .map(|h| Host {
                hostname: if h.port() == crate::ssh_port() {
                    h.name().to_string()
                } else {
                    format!("{}:{}", h.name(), h.port())
                },
                proxy: h.is_proxy(),
                version: h.version.as_ref().map(ToString::to_string),
                block_devices: h.block_devices().map(|d| d.name().to_string()).collect(),
            })
            .collect();

        let resources = topology
            .resources()
            .map(|r| Resource {
                name: r.name().to_string(),
                params: get_sections(&r.params),
                hosts: r
                    .host_bindings()
                    .map(|(name, b)| ResourceHost {
                        name: name.to_string(),
                        address: b.address.as_ref().map(ToString::to_string),
                        proxy: b.proxy.as_ref().map(|p| Proxy {
                            host: p.host.clone(),
                            inside: p.inside.to_string(),
                            outside: p.outside.to_string(),
                        }),
                    })
                    .collect(),
                volumes: r
                    .volumes()
                    .filter_map(|v| {
                        Some(Volume {
                            number: v.number(),
                            device: v.device_path.clone()?,
                            endpoints: v
                                .endpoints()
                                .map(|(host, e)| Endpoint {
                                    host: host.to_string(),
                                    disk: e.block_device.clone(),
                                    disk_override: e.disk_override.clone(),
                                    meta_disk: e.meta_disk.to_string(),
                                })
                                .collect(),
                        })
                    })
                    .collect(),
            })
            .collect();

        Config {
            engine,
            hosts,
            global: topology
                .global
                .section(Section::Global)
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        raw_value(lookup(Section::Global, name), value),
                    )
                })
                .collect(),
            common: get_sections(&topology.common),
            resources,
            crm_resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: &str = r#"
crm_resources = ["r0"]

[engine]
command_timeout = 10

[[hosts]]
hostname = "alpha"
version = "8.4.11"
block_devices = ["/dev/sdb", "/dev/sdc"]

[[hosts]]
hostname = "beta:2222"
block_devices = ["/dev/sdb", "/dev/sdc"]

[global]
usage-count = "no"

[common.net]
protocol = "B"

[[resources]]
name = "r0"

[resources.params.disk]
resync-rate = "40M"

[[resources.hosts]]
name = "alpha"
address = "10.0.0.1:7788"

[[resources.hosts]]
name = "beta"
address = "10.0.0.2:7788"

[[resources.volumes]]
number = 0
device = "/dev/drbd0"
endpoints = [
    { host = "alpha", disk = "/dev/sdb" },
    { host = "beta", disk = "/dev/sdb", meta_disk = "/dev/sdc[0]" },
]
"#;

    #[test]
    fn parses_cluster_file() {
        let config: Config = toml::from_str(CLUSTER).unwrap();
        assert_eq!(config.engine.command_timeout, 10);
        assert_eq!(config.engine.config_dir, "/etc");

        let topology = config.to_topology().unwrap();
        assert_eq!(topology.host("beta").unwrap().port(), 2222);
        let volume = topology.volume(&VolumeId::new("r0", 0)).unwrap();
        assert_eq!(
            volume.endpoint("beta").unwrap().meta_disk,
            MetaDisk::External {
                device: "/dev/sdc".to_string(),
                index: Some(0)
            }
        );
        assert!(topology
            .host("beta")
            .unwrap()
            .block_device("/dev/sdc")
            .unwrap()
            .is_meta_disk());
    }

    #[test]
    fn topology_converts_back() {
        let config: Config = toml::from_str(CLUSTER).unwrap();
        let topology = config.to_topology().unwrap();
        let back = Config::from_topology(&topology, config.engine.clone(), config.crm_resources.clone());
        assert_eq!(back, config);
    }

    #[test]
    fn rejects_invalid_topology() {
        let mut config: Config = toml::from_str(CLUSTER).unwrap();
        config.resources[0].hosts.pop();
        assert!(matches!(
            config.to_topology(),
            Err(ConfigFileError::Topology(TopologyError::TooFewHosts { .. }))
        ));

        let mut config: Config = toml::from_str(CLUSTER).unwrap();
        config.resources[0].hosts[0].address = Some("nowhere".to_string());
        assert!(matches!(
            config.to_topology(),
            Err(ConfigFileError::Invalid { what: "address", .. })
        ));
    }
}
