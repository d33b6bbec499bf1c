// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Rendering of the topology into DRBD configuration text.
//!
//! Rendering is pure: it reads the topology and produces the files for one host, or fails with a
//! [`ConfigError`] before anything is sent anywhere. The file layout and the syntax flavour are
//! decided by the DRBD version of the host the configuration is rendered for.

use std::{collections::BTreeMap, fmt::Write};

use {log::debug, thiserror::Error};

use crate::{
    host::{ConfigLayout, Host},
    params::{escape_word, quote, ParameterSet, Section, Value},
    resource::{ReplicatedResource, VolumeId},
    topology::Topology,
};

pub const GENERATED_HEADER: &str = "## generated by drbdmgr, manual changes may be overwritten\n";

/// Disk parameters that DRBD before 8.4 expects in the `syncer` section, with their old names.
const SYNCER_PARAMS: [(&str, &str); 3] = [
    ("resync-rate", "rate"),
    ("resync-after", "after"),
    ("al-extents", "al-extents"),
];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("volume {0} has no device path")]
    MissingDevicePath(VolumeId),

    #[error("volume {volume} has no endpoint on host '{host}'")]
    MissingEndpoint { volume: VolumeId, host: String },

    #[error("resource '{resource}' has no address for host '{host}'")]
    MissingAddress { resource: String, host: String },

    #[error("block device '{device}' does not exist on host '{host}'")]
    UnknownBlockDevice { host: String, device: String },

    #[error(
        "resource '{resource}' has {count} volumes, but DRBD {version} on '{host}' supports only one"
    )]
    LegacyMultiVolume {
        resource: String,
        host: String,
        version: String,
        count: usize,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// File names used by the rendered layouts, relative to the configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPaths {
    pub conf_file: String,
    pub split_dir: String,
}

impl Default for RenderPaths {
    fn default() -> Self {
        Self {
            conf_file: "drbd.conf".to_string(),
            split_dir: "drbd.d".to_string(),
        }
    }
}

impl RenderPaths {
    pub fn global_common(&self) -> String {
        format!("{}/global_common.conf", self.split_dir)
    }

    pub fn resource_file(&self, resource: &str) -> String {
        format!("{}/{resource}.res", self.split_dir)
    }
}

/// One rendered file. The path is relative to the configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

/// The complete configuration of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub host: String,
    pub layout: ConfigLayout,
    pub files: Vec<ConfigFile>,
}

impl RenderedConfig {
    pub fn file(&self, path: &str) -> Option<&ConfigFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// All files concatenated, for display.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for file in self.files.iter() {
            let _ = writeln!(out, "# {}", file.path);
            out.push_str(&file.content);
        }
        out
    }
}

/// Line writer with tab indentation.
struct Out {
    text: String,
    depth: usize,
}

impl Out {
    fn new() -> Self {
        Self {
            text: String::new(),
            depth: 0,
        }
    }

    fn line(&mut self, line: &str) {
        for _ in 0..self.depth {
            self.text.push('\t');
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn open(&mut self, head: &str) {
        self.line(&format!("{head} {{"));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth -= 1;
        self.line("}");
    }

    fn statement(&mut self, name: &str, arg: Option<&str>) {
        match arg {
            Some(arg) => self.line(&format!("{name} {arg};")),
            None => self.line(&format!("{name};")),
        }
    }
}

fn render_section(out: &mut Out, params: &ParameterSet, section: Section) {
    let lines = params.rendered(section);
    if lines.is_empty() {
        return;
    }
    out.open(section.as_str());
    for (name, arg) in lines {
        out.statement(name, arg.as_deref());
    }
    out.close();
}

/// The nested parameter sections of `common` or a resource. Pre-8.4 syntax moves `protocol` to
/// the top level and the resync options into `syncer`.
fn render_params(out: &mut Out, params: &ParameterSet, legacy: bool) {
    if !legacy {
        for section in Section::NESTED {
            render_section(out, params, section);
        }
        return;
    }

    let mut params = params.clone();
    if let Some(protocol) = params.get(Section::Net, "protocol").cloned() {
        params.remove(Section::Net, "protocol");
        if let Value::Word(protocol) = protocol {
            out.statement("protocol", Some(&escape_word(&protocol)));
        }
    }

    let mut syncer = ParameterSet::new();
    for (new, _) in SYNCER_PARAMS {
        if let Some(value) = params.get(Section::Disk, new).cloned() {
            params.remove(Section::Disk, new);
            syncer.set_value(Section::Disk, new, value);
        }
    }
    let syncer_lines = syncer.rendered(Section::Disk);
    if !syncer_lines.is_empty() {
        out.open("syncer");
        for (name, arg) in syncer_lines {
            let old = SYNCER_PARAMS
                .iter()
                .find(|(new, _)| *new == name)
                .map_or(name, |(_, old)| *old);
            out.statement(old, arg.as_deref());
        }
        out.close();
    }

    for section in Section::NESTED {
        render_section(out, &params, section);
    }
}

/// The `global { }` block. Always present, possibly empty.
pub fn render_global(global: &ParameterSet) -> String {
    let mut out = Out::new();
    out.open("global");
    for (name, arg) in global.rendered(Section::Global) {
        out.statement(name, arg.as_deref());
    }
    out.close();
    out.text
}

/// The `common { }` block. Always present, possibly empty.
pub fn render_common(common: &ParameterSet, legacy: bool) -> String {
    let mut out = Out::new();
    out.open("common");
    render_params(&mut out, common, legacy);
    out.close();
    out.text
}

/// The stanza of one resource, in the syntax understood by `for_host`.
pub fn render_resource(
    topology: &Topology,
    resource: &ReplicatedResource,
    for_host: &Host,
) -> Result<String> {
    let legacy = !for_host.version().has_volumes();
    let volumes: Vec<_> = resource.volumes().collect();
    if legacy && volumes.len() > 1 {
        return Err(ConfigError::LegacyMultiVolume {
            resource: resource.name().to_string(),
            host: for_host.name().to_string(),
            version: for_host.version().to_string(),
            count: volumes.len(),
        });
    }

    let mut out = Out::new();
    out.open(&format!("resource {}", escape_word(resource.name())));
    render_params(&mut out, &resource.params, legacy);

    for (host_name, binding) in resource.host_bindings() {
        let address = binding
            .address
            .as_ref()
            .ok_or_else(|| ConfigError::MissingAddress {
                resource: resource.name().to_string(),
                host: host_name.to_string(),
            })?;
        let host = topology
            .host(host_name)
            .ok_or_else(|| ConfigError::UnknownHost(host_name.to_string()))?;

        out.open(&format!("on {}", escape_word(host_name)));
        out.statement("address", Some(&address.to_string()));

        for volume in volumes.iter() {
            let id = VolumeId::new(resource.name(), volume.number());
            let endpoint =
                volume
                    .endpoint(host_name)
                    .ok_or_else(|| ConfigError::MissingEndpoint {
                        volume: id.clone(),
                        host: host_name.to_string(),
                    })?;
            let device = volume
                .device_path
                .as_deref()
                .ok_or_else(|| ConfigError::MissingDevicePath(id.clone()))?;
            if endpoint.disk_override.is_none()
                && host.block_device(&endpoint.block_device).is_none()
            {
                return Err(ConfigError::UnknownBlockDevice {
                    host: host_name.to_string(),
                    device: endpoint.block_device.clone(),
                });
            }

            if !legacy {
                out.open(&format!("volume {}", volume.number()));
            }
            out.statement("device", Some(&escape_word(device)));
            out.statement("disk", Some(&escape_word(endpoint.disk())));
            out.statement("meta-disk", Some(&endpoint.meta_disk.to_string()));
            if !legacy {
                out.close();
            }
        }

        if let Some(proxy) = &binding.proxy {
            out.open(&format!("proxy on {}", escape_word(&proxy.host)));
            out.statement("inside", Some(&proxy.inside.to_string()));
            out.statement("outside", Some(&proxy.outside.to_string()));
            out.close();
        }
        out.close();
    }

    out.close();
    Ok(out.text)
}

/// Render the configuration of `host_name`: global and common sections plus every resource that
/// spans the host or is relayed by it.
pub fn render_host(
    topology: &Topology,
    host_name: &str,
    paths: &RenderPaths,
) -> Result<RenderedConfig> {
    let host = topology
        .host(host_name)
        .ok_or_else(|| ConfigError::UnknownHost(host_name.to_string()))?;
    let legacy = !host.version().has_volumes();
    let layout = host.config_layout();

    let mut resources = BTreeMap::new();
    for resource in topology.resources() {
        if !resource.is_relevant_to(host_name) {
            continue;
        }
        if resource.volumes().next().is_none() {
            debug!(
                "{host_name}: not rendering resource {} without volumes",
                resource.name()
            );
            continue;
        }
        resources.insert(
            resource.name().to_string(),
            render_resource(topology, resource, host)?,
        );
    }

    let global_common = format!(
        "{}\n{}",
        render_global(&topology.global),
        render_common(&topology.common, legacy)
    );

    let files = match layout {
        ConfigLayout::SingleFile => {
            let mut content = format!("{GENERATED_HEADER}\n{global_common}");
            for stanza in resources.values() {
                content.push('\n');
                content.push_str(stanza);
            }
            vec![ConfigFile {
                path: paths.conf_file.clone(),
                content,
            }]
        }
        ConfigLayout::SplitDirectory => {
            let mut files = vec![
                ConfigFile {
                    path: paths.conf_file.clone(),
                    content: format!(
                        "{GENERATED_HEADER}\ninclude {};\ninclude {};\n",
                        quote(&paths.global_common()),
                        quote(&format!("{}/*.res", paths.split_dir)),
                    ),
                },
                ConfigFile {
                    path: paths.global_common(),
                    content: format!("{GENERATED_HEADER}\n{global_common}"),
                },
            ];
            files.extend(resources.into_iter().map(|(name, stanza)| ConfigFile {
                path: paths.resource_file(&name),
                content: format!("{GENERATED_HEADER}\n{stanza}"),
            }));
            files
        }
    };

    Ok(RenderedConfig {
        host: host_name.to_string(),
        layout,
        files,
    })
}

/// Render every host of the topology. Fails on the first configuration error, so nothing is
/// ever sent when any host's configuration is invalid.
pub fn render_all(
    topology: &Topology,
    paths: &RenderPaths,
) -> Result<BTreeMap<String, RenderedConfig>> {
    topology
        .hosts()
        .map(|host| Ok((host.name().to_string(), render_host(topology, host.name(), paths)?)))
        .collect()
}
