// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Parser for the DRBD configuration grammar, as written by the renderer and as printed by
//! `drbdadm dump all` on a host.
//!
//! Both the volume syntax of 8.4 and the single-volume syntax of older releases are accepted;
//! the result is always expressed in volumes.

use std::collections::BTreeMap;

use {log::debug, thiserror::Error};

use crate::{
    params::{ParamError, ParameterSet, Section},
    resource::{Address, MetaDisk, ProxyBinding},
    topology::DEVICE_PATH_PREFIX,
};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {line}: unexpected end of input, expected {expected}")]
    UnexpectedEof { line: usize, expected: &'static str },

    #[error("line {line}: unexpected '{found}', expected {expected}")]
    Unexpected {
        line: usize,
        found: String,
        expected: &'static str,
    },

    #[error("line {line}: invalid {what} '{value}'")]
    Invalid {
        line: usize,
        what: &'static str,
        value: String,
    },

    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },

    #[error("line {line}: {source}")]
    Param { line: usize, source: ParamError },
}

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
    Semi,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Quoted(q) => format!("\"{q}\""),
            Token::Open => "{".to_string(),
            Token::Close => "}".to_string(),
            Token::Semi => ";".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '{' => tokens.push((line, Token::Open)),
            '}' => tokens.push((line, Token::Close)),
            ';' => tokens.push((line, Token::Semi)),
            '"' => {
                let start = line;
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(ParseError::UnterminatedString { line: start }),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(ParseError::UnterminatedString { line: start }),
                        },
                        Some('\n') => {
                            line += 1;
                            s.push('\n');
                        }
                        Some(other) => s.push(other),
                    }
                }
                tokens.push((start, Token::Quoted(s)));
            }
            c => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || "{};\"#".contains(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push((line, Token::Word(word)));
            }
        }
    }
    Ok(tokens)
}

/// A whole configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedConfig {
    pub global: ParameterSet,
    pub common: ParameterSet,
    pub resources: Vec<ParsedResource>,
}

impl ParsedConfig {
    pub fn resource(&self, name: &str) -> Option<&ParsedResource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResource {
    pub name: String,
    pub params: ParameterSet,
    pub hosts: Vec<ParsedHost>,

    /// Volume statements written at resource level, which apply to every host.
    pub shared_volumes: Vec<ParsedVolume>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedHost {
    pub name: String,
    pub address: Option<Address>,
    pub proxy: Option<ProxyBinding>,
    pub volumes: Vec<ParsedVolume>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedVolume {
    pub number: u32,
    pub device: Option<String>,
    pub disk: Option<String>,
    pub meta_disk: Option<MetaDisk>,
}

impl ParsedVolume {
    fn new(number: u32) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    /// Fill fields missing here from `other`.
    fn inherit(&mut self, other: &ParsedVolume) {
        if self.device.is_none() {
            self.device.clone_from(&other.device);
        }
        if self.disk.is_none() {
            self.disk.clone_from(&other.disk);
        }
        if self.meta_disk.is_none() {
            self.meta_disk.clone_from(&other.meta_disk);
        }
    }
}

/// A volume as seen across all hosts of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedVolume {
    pub number: u32,
    pub device: Option<String>,
    pub endpoints: BTreeMap<String, MergedEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedEndpoint {
    pub disk: String,
    pub meta_disk: MetaDisk,
}

impl ParsedResource {
    pub fn host(&self, name: &str) -> Option<&ParsedHost> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// The volumes of this resource, combining per-host and resource-level statements. Hosts
    /// without a backing disk for a volume get no endpoint for it.
    pub fn volumes(&self) -> Vec<MergedVolume> {
        let mut merged: BTreeMap<u32, MergedVolume> = BTreeMap::new();

        for host in self.hosts.iter() {
            let mut numbers: Vec<u32> = host.volumes.iter().map(|v| v.number).collect();
            numbers.extend(self.shared_volumes.iter().map(|v| v.number));
            numbers.sort_unstable();
            numbers.dedup();

            for number in numbers {
                let mut volume = host
                    .volumes
                    .iter()
                    .find(|v| v.number == number)
                    .cloned()
                    .unwrap_or_else(|| ParsedVolume::new(number));
                if let Some(shared) = self.shared_volumes.iter().find(|v| v.number == number) {
                    volume.inherit(shared);
                }

                let entry = merged.entry(number).or_insert_with(|| MergedVolume {
                    number,
                    device: None,
                    endpoints: BTreeMap::new(),
                });
                if entry.device.is_none() {
                    entry.device = volume.device.clone();
                }
                if let Some(disk) = volume.disk {
                    entry.endpoints.insert(
                        host.name.clone(),
                        MergedEndpoint {
                            disk,
                            meta_disk: volume.meta_disk.unwrap_or_default(),
                        },
                    );
                }
            }
        }
        merged.into_values().collect()
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map_or(1, |(line, _)| *line)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token> {
        let line = self.line();
        let token = self
            .tokens
            .get(self.pos)
            .map(|(_, t)| t.clone())
            .ok_or(ParseError::UnexpectedEof { line, expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token, expected: &'static str) -> ParseError {
        ParseError::Unexpected {
            line: self.line(),
            found: token.describe(),
            expected,
        }
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<()> {
        let token = self.next(expected)?;
        if token == want {
            Ok(())
        } else {
            self.pos -= 1;
            Err(self.unexpected(&token, expected))
        }
    }

    /// A word or quoted string.
    fn word(&mut self, expected: &'static str) -> Result<String> {
        match self.next(expected)? {
            Token::Word(w) | Token::Quoted(w) => Ok(w),
            other => {
                self.pos -= 1;
                Err(self.unexpected(&other, expected))
            }
        }
    }

    /// The words of a statement up to and including its terminating `;`.
    fn arguments(&mut self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        loop {
            match self.next("';'")? {
                Token::Semi => return Ok(args),
                Token::Word(w) | Token::Quoted(w) => args.push(w),
                other => {
                    self.pos -= 1;
                    return Err(self.unexpected(&other, "';'"));
                }
            }
        }
    }

    /// Skip a statement or block we do not model.
    fn skip_statement(&mut self) -> Result<()> {
        let mut depth = 0;
        loop {
            match self.next("';' or '}'")? {
                Token::Semi if depth == 0 => return Ok(()),
                Token::Open => depth += 1,
                Token::Close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn at_close(&mut self) -> bool {
        if self.peek() == Some(&Token::Close) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Read the arguments of a parameter statement and set it.
    fn param(&mut self, params: &mut ParameterSet, section: Section, name: &str) -> Result<()> {
        let line = self.line();
        let args = self.arguments()?;
        params
            .set(section, name, &args.join(" "))
            .map_err(|source| ParseError::Param { line, source })
    }

    /// `{ name args; ... }` into one section.
    fn section_block(
        &mut self,
        params: &mut ParameterSet,
        section: Section,
        rename: fn(&str) -> &str,
    ) -> Result<()> {
        self.expect(Token::Open, "'{'")?;
        while !self.at_close() {
            let name = self.word("parameter name")?;
            self.param(params, section, rename(&name))?;
        }
        Ok(())
    }

    /// A statement inside `common` or `resource` that sets parameters: a nested section, the
    /// 8.3 `syncer` section or a top-level `protocol`. Returns false if `keyword` is none of
    /// these.
    fn parameter_statement(&mut self, keyword: &str, params: &mut ParameterSet) -> Result<bool> {
        match keyword {
            "protocol" => self.param(params, Section::Net, "protocol")?,
            "syncer" => self.section_block(params, Section::Disk, syncer_name)?,
            // `disk <path>;` at resource level is a legacy volume statement, not a section.
            _ if self.peek() != Some(&Token::Open) => return Ok(false),
            other => match other.parse::<Section>() {
                Ok(Section::Global) | Err(_) => return Ok(false),
                Ok(section) => self.section_block(params, section, |n| n)?,
            },
        }
        Ok(true)
    }

    fn config(&mut self) -> Result<ParsedConfig> {
        let mut config = ParsedConfig::default();
        while self.peek().is_some() {
            let keyword = self.word("'global', 'common' or 'resource'")?;
            match keyword.as_str() {
                "global" => self.section_block(&mut config.global, Section::Global, |n| n)?,
                "common" => {
                    self.expect(Token::Open, "'{'")?;
                    while !self.at_close() {
                        let keyword = self.word("section name")?;
                        if !self.parameter_statement(&keyword, &mut config.common)? {
                            debug!("skipping '{keyword}' in common");
                            self.skip_statement()?;
                        }
                    }
                }
                "resource" => {
                    let resource = self.resource()?;
                    config.resources.push(resource);
                }
                "include" => {
                    self.arguments()?;
                }
                other => {
                    debug!("skipping top-level '{other}'");
                    self.skip_statement()?;
                }
            }
        }
        Ok(config)
    }

    fn resource(&mut self) -> Result<ParsedResource> {
        let mut resource = ParsedResource {
            name: self.word("resource name")?,
            ..Default::default()
        };
        self.expect(Token::Open, "'{'")?;
        let mut legacy = ParsedVolume::new(0);

        while !self.at_close() {
            let keyword = self.word("resource statement")?;
            if self.parameter_statement(&keyword, &mut resource.params)? {
                continue;
            }
            match keyword.as_str() {
                "on" => {
                    let host = self.host()?;
                    resource.hosts.push(host);
                }
                "volume" => {
                    let volume = self.volume()?;
                    resource.shared_volumes.push(volume);
                }
                "device" | "disk" | "meta-disk" => self.volume_statement(&keyword, &mut legacy)?,
                other => {
                    debug!("skipping '{other}' in resource {}", resource.name);
                    self.skip_statement()?;
                }
            }
        }

        if legacy != ParsedVolume::new(0) {
            resource.shared_volumes.push(legacy);
        }
        Ok(resource)
    }

    fn host(&mut self) -> Result<ParsedHost> {
        let mut host = ParsedHost {
            name: self.word("host name")?,
            ..Default::default()
        };
        self.expect(Token::Open, "'{'")?;
        let mut legacy = ParsedVolume::new(0);

        while !self.at_close() {
            let keyword = self.word("host statement")?;
            match keyword.as_str() {
                "address" => host.address = Some(self.address()?),
                "volume" => host.volumes.push(self.volume()?),
                "device" | "disk" | "meta-disk" => self.volume_statement(&keyword, &mut legacy)?,
                "proxy" => host.proxy = Some(self.proxy()?),
                other => {
                    debug!("skipping '{other}' on host {}", host.name);
                    self.skip_statement()?;
                }
            }
        }

        if legacy != ParsedVolume::new(0) {
            host.volumes.push(legacy);
        }
        Ok(host)
    }

    fn address(&mut self) -> Result<Address> {
        let line = self.line();
        let args = self.arguments()?;
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        Address::parse(&words).ok_or(ParseError::Invalid {
            line,
            what: "address",
            value: args.join(" "),
        })
    }

    /// `proxy on <host> { inside <addr>; outside <addr>; }`
    fn proxy(&mut self) -> Result<ProxyBinding> {
        let on = self.word("'on'")?;
        if on != "on" {
            return Err(ParseError::Unexpected {
                line: self.line(),
                found: on,
                expected: "'on'",
            });
        }
        let host = self.word("proxy host name")?;
        self.expect(Token::Open, "'{'")?;
        let (mut inside, mut outside) = (None, None);
        while !self.at_close() {
            match self.word("'inside' or 'outside'")?.as_str() {
                "inside" => inside = Some(self.address()?),
                "outside" => outside = Some(self.address()?),
                _ => self.skip_statement()?,
            }
        }
        let line = self.line();
        match (inside, outside) {
            (Some(inside), Some(outside)) => Ok(ProxyBinding {
                host,
                inside,
                outside,
            }),
            _ => Err(ParseError::Invalid {
                line,
                what: "proxy section without inside and outside addresses for",
                value: host,
            }),
        }
    }

    fn volume(&mut self) -> Result<ParsedVolume> {
        let line = self.line();
        let number = self.word("volume number")?;
        let number = number.parse().map_err(|_| ParseError::Invalid {
            line,
            what: "volume number",
            value: number,
        })?;
        let mut volume = ParsedVolume::new(number);
        self.expect(Token::Open, "'{'")?;
        while !self.at_close() {
            let keyword = self.word("volume statement")?;
            match keyword.as_str() {
                "device" | "disk" | "meta-disk" => self.volume_statement(&keyword, &mut volume)?,
                other => {
                    debug!("skipping '{other}' in volume {number}");
                    self.skip_statement()?;
                }
            }
        }
        Ok(volume)
    }

    fn volume_statement(&mut self, keyword: &str, volume: &mut ParsedVolume) -> Result<()> {
        let line = self.line();
        let args = self.arguments()?;
        let invalid = |what| ParseError::Invalid {
            line,
            what,
            value: args.join(" "),
        };
        match keyword {
            "device" => volume.device = Some(parse_device(&args).ok_or_else(|| invalid("device"))?),
            "disk" => volume.disk = Some(args.first().cloned().ok_or_else(|| invalid("disk"))?),
            _ => {
                let words: Vec<&str> = args.iter().map(String::as_str).collect();
                volume.meta_disk = Some(MetaDisk::parse(&words).ok_or_else(|| invalid("meta-disk"))?);
            }
        }
        Ok(())
    }
}

/// `device <path>`, `device <path> minor <n>` or `device minor <n>`.
fn parse_device(args: &[String]) -> Option<String> {
    match args {
        [path] => Some(path.clone()),
        [path, minor, _] if minor == "minor" => Some(path.clone()),
        [minor, n] if minor == "minor" => {
            let n: u32 = n.parse().ok()?;
            Some(format!("{DEVICE_PATH_PREFIX}{n}"))
        }
        _ => None,
    }
}

/// DRBD 8.3 kept the resync options in a `syncer` section; they live in `disk` nowadays.
fn syncer_name(name: &str) -> &str {
    match name {
        "rate" => "resync-rate",
        "after" => "resync-after",
        other => other,
    }
}

/// Parse a configuration file.
pub fn parse(input: &str) -> Result<ParsedConfig> {
    let tokens = tokenize(input)?;
    Parser { tokens, pos: 0 }.config()
}
