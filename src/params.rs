// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Typed configuration parameters.
//!
//! Every known parameter has a section, a kind and (usually) a documented default. Values are
//! normalized when they are set, so two parameter sets that would render identically compare
//! equal.

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Global,
    Options,
    Startup,
    Disk,
    Net,
    Handlers,
    Proxy,
}

impl Section {
    /// Order in which nested sections are rendered.
    pub const NESTED: [Section; 6] = [
        Section::Options,
        Section::Startup,
        Section::Disk,
        Section::Net,
        Section::Handlers,
        Section::Proxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Global => "global",
            Section::Options => "options",
            Section::Startup => "startup",
            Section::Disk => "disk",
            Section::Net => "net",
            Section::Handlers => "handlers",
            Section::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Section {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "global" => Section::Global,
            "options" => Section::Options,
            "startup" => Section::Startup,
            "disk" => Section::Disk,
            "net" => Section::Net,
            "handlers" => Section::Handlers,
            "proxy" => Section::Proxy,
            other => return Err(ParamError::UnknownSection(other.to_string())),
        })
    }
}

/// The unit a bare number is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// A plain count (or a time in the parameter's own resolution). No suffix allowed.
    Count,
    Bytes,
    KiB,
}

impl Unit {
    fn bytes(&self) -> u64 {
        match self {
            Unit::Count | Unit::Bytes => 1,
            Unit::KiB => 1 << 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Legacy no-argument directive: presence means true, absence means false.
    Flag,
    /// `yes` / `no`.
    Bool,
    Number(Unit),
    /// A bare keyword, quoted only if it contains unusual characters.
    Word,
    /// Free text, always quoted.
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    None,
    Bool(bool),
    Number(u64),
    Word(&'static str),
}

#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub section: Section,
    pub kind: Kind,
    pub default: DefaultValue,
}

const fn spec(name: &'static str, section: Section, kind: Kind, default: DefaultValue) -> ParamSpec {
    ParamSpec {
        name,
        section,
        kind,
        default,
    }
}

use self::{DefaultValue as D, Kind as K, Section as S};

static CATALOG: &[ParamSpec] = &[
    spec("usage-count", S::Global, K::Word, D::Word("ask")),
    spec("minor-count", S::Global, K::Number(Unit::Count), D::Number(32)),
    spec("dialog-refresh", S::Global, K::Number(Unit::Count), D::Number(1)),
    spec("disable-ip-verification", S::Global, K::Flag, D::None),
    spec("udev-always-use-vnr", S::Global, K::Flag, D::None),
    spec("cpu-mask", S::Options, K::Word, D::None),
    spec("on-no-data-accessible", S::Options, K::Word, D::Word("io-error")),
    spec("wfc-timeout", S::Startup, K::Number(Unit::Count), D::Number(0)),
    spec("degr-wfc-timeout", S::Startup, K::Number(Unit::Count), D::Number(0)),
    spec("outdated-wfc-timeout", S::Startup, K::Number(Unit::Count), D::Number(0)),
    spec("wait-after-sb", S::Startup, K::Flag, D::None),
    spec("become-primary-on", S::Startup, K::Word, D::None),
    spec("on-io-error", S::Disk, K::Word, D::Word("detach")),
    spec("fencing", S::Disk, K::Word, D::Word("dont-care")),
    spec("resync-rate", S::Disk, K::Number(Unit::KiB), D::Number(250)),
    spec("resync-after", S::Disk, K::Word, D::None),
    spec("al-extents", S::Disk, K::Number(Unit::Count), D::Number(1237)),
    spec("c-plan-ahead", S::Disk, K::Number(Unit::Count), D::Number(20)),
    spec("c-max-rate", S::Disk, K::Number(Unit::KiB), D::Number(102400)),
    spec("c-min-rate", S::Disk, K::Number(Unit::KiB), D::Number(250)),
    spec("disk-flushes", S::Disk, K::Bool, D::Bool(true)),
    spec("md-flushes", S::Disk, K::Bool, D::Bool(true)),
    spec("protocol", S::Net, K::Word, D::Word("C")),
    spec("timeout", S::Net, K::Number(Unit::Count), D::Number(60)),
    spec("connect-int", S::Net, K::Number(Unit::Count), D::Number(10)),
    spec("ping-int", S::Net, K::Number(Unit::Count), D::Number(10)),
    spec("ping-timeout", S::Net, K::Number(Unit::Count), D::Number(5)),
    spec("max-buffers", S::Net, K::Number(Unit::Count), D::Number(2048)),
    spec("max-epoch-size", S::Net, K::Number(Unit::Count), D::Number(2048)),
    spec("ko-count", S::Net, K::Number(Unit::Count), D::Number(7)),
    spec("sndbuf-size", S::Net, K::Number(Unit::Bytes), D::Number(0)),
    spec("rcvbuf-size", S::Net, K::Number(Unit::Bytes), D::Number(0)),
    spec("allow-two-primaries", S::Net, K::Flag, D::None),
    spec("always-asbp", S::Net, K::Flag, D::None),
    spec("discard-my-data", S::Net, K::Flag, D::None),
    spec("cram-hmac-alg", S::Net, K::Word, D::None),
    spec("shared-secret", S::Net, K::Text, D::None),
    spec("verify-alg", S::Net, K::Word, D::None),
    spec("csums-alg", S::Net, K::Word, D::None),
    spec("data-integrity-alg", S::Net, K::Word, D::None),
    spec("after-sb-0pri", S::Net, K::Word, D::Word("disconnect")),
    spec("after-sb-1pri", S::Net, K::Word, D::Word("disconnect")),
    spec("after-sb-2pri", S::Net, K::Word, D::Word("disconnect")),
    spec("rr-conflict", S::Net, K::Word, D::Word("disconnect")),
    spec("memlimit", S::Proxy, K::Number(Unit::Bytes), D::Number(16 << 20)),
    spec("compression", S::Proxy, K::Word, D::Word("off")),
];

/// Handler names are open-ended; any handler is a quoted shell command without a default.
static HANDLER: ParamSpec = spec("", S::Handlers, K::Text, D::None);

/// Look up the spec of a parameter. Unknown handlers get the generic handler spec; other
/// unknown parameters return `None`.
pub fn lookup(section: Section, name: &str) -> Option<&'static ParamSpec> {
    CATALOG
        .iter()
        .find(|p| p.section == section && p.name == name)
        .or(match section {
            Section::Handlers => Some(&HANDLER),
            _ => None,
        })
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown section '{0}'")]
    UnknownSection(String),

    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: &'static str,
    },
}

/// A normalized parameter value. Numbers are stored in the parameter's default unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Flag,
    Bool(bool),
    Number(u64),
    Word(String),
    Text(String),
}

impl Value {
    /// Parse a raw value for a known parameter. Returns `Ok(None)` for a flag that is being
    /// switched off.
    pub fn parse(spec: &ParamSpec, name: &str, raw: &str) -> Result<Option<Value>, ParamError> {
        let invalid = |reason| ParamError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
            reason,
        };
        let raw = raw.trim();
        Ok(Some(match spec.kind {
            Kind::Flag => match raw {
                "" | "yes" | "true" | "on" => Value::Flag,
                "no" | "false" | "off" => return Ok(None),
                _ => return Err(invalid("expected yes or no")),
            },
            Kind::Bool => match raw {
                "yes" | "true" | "on" => Value::Bool(true),
                "no" | "false" | "off" => Value::Bool(false),
                _ => return Err(invalid("expected yes or no")),
            },
            Kind::Number(unit) => Value::Number(parse_number(raw, unit).ok_or_else(|| {
                invalid(match unit {
                    Unit::Count => "expected a number",
                    _ => "expected a number with optional K, M or G suffix",
                })
            })?),
            Kind::Word if raw.is_empty() => return Err(invalid("value is empty")),
            Kind::Word => Value::Word(raw.to_string()),
            Kind::Text => Value::Text(raw.to_string()),
        }))
    }
}

fn parse_number(raw: &str, unit: Unit) -> Option<u64> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let suffix_bytes: u64 = match (suffix, unit) {
        ("", _) => return n.checked_mul(unit.bytes()).map(|_| n),
        (_, Unit::Count) => return None,
        ("k" | "K", _) => 1 << 10,
        ("m" | "M", _) => 1 << 20,
        ("g" | "G", _) => 1 << 30,
        _ => return None,
    };
    n.checked_mul(suffix_bytes).map(|bytes| bytes / unit.bytes())
}

/// Render a number in the largest suffix that represents it exactly. KiB-based parameters always
/// carry a suffix so the unit is never ambiguous.
fn render_number(n: u64, unit: Unit) -> String {
    if unit == Unit::Count {
        return n.to_string();
    }
    // Only KiB values can overflow here.
    let Some(bytes) = n.checked_mul(unit.bytes()) else {
        return format!("{n}K");
    };
    for (suffix, size) in [("G", 1u64 << 30), ("M", 1 << 20), ("K", 1 << 10)] {
        if bytes > 0 && bytes % size == 0 {
            return format!("{}{suffix}", bytes / size);
        }
    }
    match unit {
        Unit::KiB => format!("{n}K"),
        _ => n.to_string(),
    }
}

fn is_bare_word(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.:/+-".contains(c))
}

/// Quote a string for the config grammar, escaping backslashes and double quotes.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Emit a keyword bare when the grammar allows it, quoted otherwise.
pub fn escape_word(s: &str) -> String {
    if is_bare_word(s) {
        s.to_string()
    } else {
        quote(s)
    }
}

/// Render the argument of a parameter line, or `None` for a flag (which has no argument).
pub fn render_value(spec: Option<&ParamSpec>, value: &Value) -> Option<String> {
    Some(match value {
        Value::Flag => return None,
        Value::Bool(b) => if *b { "yes" } else { "no" }.to_string(),
        Value::Number(n) => {
            let unit = match spec.map(|s| s.kind) {
                Some(Kind::Number(unit)) => unit,
                _ => Unit::Count,
            };
            render_number(*n, unit)
        }
        Value::Word(w) => escape_word(w),
        Value::Text(t) => quote(t),
    })
}

/// The value as it would be written by a user: like [`render_value`], but never quoted, and
/// empty for a flag.
pub fn raw_value(spec: Option<&ParamSpec>, value: &Value) -> String {
    match value {
        Value::Flag => String::new(),
        Value::Word(w) | Value::Text(w) => w.clone(),
        other => render_value(spec, other).unwrap_or_default(),
    }
}

/// Whether `value` equals the documented default of the parameter, in which case it is left out
/// of the rendered configuration. Flags are never defaults: their presence is their value.
pub fn is_default(spec: &ParamSpec, value: &Value) -> bool {
    match (spec.default, value) {
        (DefaultValue::Bool(d), Value::Bool(v)) => d == *v,
        (DefaultValue::Number(d), Value::Number(v)) => d == *v,
        (DefaultValue::Word(d), Value::Word(v)) => d == v,
        _ => false,
    }
}

/// A set of parameters, grouped by section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterSet {
    sections: BTreeMap<Section, BTreeMap<String, Value>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter from its textual value. Known parameters are validated and normalized;
    /// unknown ones are kept as a bare word.
    pub fn set(&mut self, section: Section, name: &str, raw: &str) -> Result<(), ParamError> {
        match lookup(section, name) {
            Some(spec) => match Value::parse(spec, name, raw)? {
                Some(value) => self.set_value(section, name, value),
                None => self.remove(section, name),
            },
            None if raw.is_empty() => self.set_value(section, name, Value::Flag),
            None => self.set_value(section, name, Value::Word(raw.to_string())),
        }
        Ok(())
    }

    pub fn set_value(&mut self, section: Section, name: &str, value: Value) {
        self.sections
            .entry(section)
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn set_flag(&mut self, section: Section, name: &str, on: bool) {
        if on {
            self.set_value(section, name, Value::Flag);
        } else {
            self.remove(section, name);
        }
    }

    pub fn remove(&mut self, section: Section, name: &str) {
        if let Some(params) = self.sections.get_mut(&section) {
            params.remove(name);
            if params.is_empty() {
                self.sections.remove(&section);
            }
        }
    }

    pub fn get(&self, section: Section, name: &str) -> Option<&Value> {
        self.sections.get(&section)?.get(name)
    }

    pub fn has_flag(&self, section: Section, name: &str) -> bool {
        matches!(self.get(section, name), Some(Value::Flag))
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The parameters of one section, in name order.
    pub fn section(&self, section: Section) -> impl Iterator<Item = (&str, &Value)> {
        self.sections
            .get(&section)
            .into_iter()
            .flat_map(|params| params.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Every parameter with its section.
    pub fn iter(&self) -> impl Iterator<Item = (Section, &str, &Value)> {
        self.sections.iter().flat_map(|(section, params)| {
            params
                .iter()
                .map(move |(name, value)| (*section, name.as_str(), value))
        })
    }

    /// The lines that would be rendered for `section`: `(name, argument)` pairs with defaults
    /// omitted.
    pub fn rendered(&self, section: Section) -> Vec<(&str, Option<String>)> {
        self.section(section)
            .filter_map(|(name, value)| {
                let spec = lookup(section, name);
                if spec.is_some_and(|s| is_default(s, value)) {
                    return None;
                }
                Some((name, render_value(spec, value)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_normalized_to_default_unit() {
        let mut params = ParameterSet::new();
        params.set(Section::Disk, "resync-rate", "1M").unwrap();
        assert_eq!(
            params.get(Section::Disk, "resync-rate"),
            Some(&Value::Number(1024))
        );

        params.set(Section::Net, "sndbuf-size", "512k").unwrap();
        assert_eq!(
            params.get(Section::Net, "sndbuf-size"),
            Some(&Value::Number(512 * 1024))
        );

        assert!(params.set(Section::Net, "max-buffers", "8K").is_err());
        assert!(params.set(Section::Disk, "resync-rate", "fast").is_err());
    }

    #[test]
    fn numbers_too_large_for_bytes_are_refused() {
        let mut params = ParameterSet::new();
        assert!(params
            .set(Section::Disk, "resync-rate", "18014398509481984")
            .is_err());
        assert!(params
            .set(Section::Disk, "resync-rate", "18014398509481984K")
            .is_err());
        assert!(params.get(Section::Disk, "resync-rate").is_none());

        params.set(Section::Disk, "resync-rate", "18014398509481983").unwrap();
        params.set(Section::Net, "sndbuf-size", "18446744073709551615").unwrap();

        // Values set directly still render instead of overflowing.
        params.set_value(Section::Disk, "c-max-rate", Value::Number(u64::MAX));
        assert_eq!(
            params.rendered(Section::Disk),
            vec![
                ("c-max-rate", Some(format!("{}K", u64::MAX))),
                ("resync-rate", Some("18014398509481983K".to_string())),
            ]
        );
    }

    #[test]
    fn default_values_are_omitted_and_neighbours_emitted() {
        let mut params = ParameterSet::new();
        params.set(Section::Disk, "resync-rate", "250").unwrap();
        params.set(Section::Disk, "al-extents", "1237").unwrap();
        assert!(params.rendered(Section::Disk).is_empty());

        params.set(Section::Disk, "resync-rate", "251").unwrap();
        params.set(Section::Disk, "al-extents", "1238").unwrap();
        assert_eq!(
            params.rendered(Section::Disk),
            vec![
                ("al-extents", Some("1238".to_string())),
                ("resync-rate", Some("251K".to_string())),
            ]
        );

        params.set(Section::Disk, "resync-rate", "40960").unwrap();
        assert_eq!(
            params.rendered(Section::Disk)[1],
            ("resync-rate", Some("40M".to_string()))
        );
    }

    #[test]
    fn flags_are_presence_only() {
        let mut params = ParameterSet::new();
        params.set(Section::Net, "allow-two-primaries", "").unwrap();
        assert_eq!(
            params.rendered(Section::Net),
            vec![("allow-two-primaries", None)]
        );

        params.set(Section::Net, "allow-two-primaries", "no").unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn raw_values_parse_back() {
        let mut params = ParameterSet::new();
        params.set(Section::Disk, "resync-rate", "40960").unwrap();
        params.set(Section::Net, "allow-two-primaries", "").unwrap();
        params.set(Section::Net, "shared-secret", "not so \"secret\"").unwrap();

        let mut copy = ParameterSet::new();
        for (section, name, value) in params.iter() {
            copy.set(section, name, &raw_value(lookup(section, name), value))
                .unwrap();
        }
        assert_eq!(copy, params);
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_word("call-pri-lost-after-sb"), "call-pri-lost-after-sb");
        assert_eq!(escape_word("two words"), "\"two words\"");
        assert_eq!(quote("say \"hi\" \\o/"), "\"say \\\"hi\\\" \\\\o/\"");

        let mut params = ParameterSet::new();
        params
            .set(Section::Handlers, "split-brain", "/usr/lib/drbd/notify-split-brain.sh root")
            .unwrap();
        assert_eq!(
            params.rendered(Section::Handlers),
            vec![(
                "split-brain",
                Some("\"/usr/lib/drbd/notify-split-brain.sh root\"".to_string())
            )]
        );
    }
}
