//! Client descriptor files (spec.md §6).
//!
//! A `.client` file lets the registry learn a client's capabilities
//! and filters without waking the service over the bus. Format:
//!
//! ```text
//! [ChannelDispatcher]
//! Interfaces=Approver;Handler
//!
//! [Approver.ApproverChannelFilter 0]
//! type s=text
//!
//! [Handler.HandlerChannelFilter 0]
//! type s=text
//! BypassApproval=true
//! ```
//!
//! Filter entries are `name <type-code>=value`; see
//! [`crate::value::Value::widen_from_code`] for the type-code table.
//! An entry with an unrecognised type code is dropped with a warning,
//! not the whole client (spec.md §7).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::RegistryError;
use crate::filter::Filter;
use crate::value::Value;

/// Environment variable that, when set, is searched first (and
/// exclusively in tests) for client descriptor files.
pub const TEST_OVERRIDE_ENV: &str = "CHANNEL_DISPATCHER_CLIENT_DIR";

const SUBPATH: &str = "channel-dispatcher/clients";
const SUFFIX: &str = ".client";

/// A parsed descriptor, pre-normalisation into a [`crate::registry::client::Client`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientDescriptor {
    pub interfaces: Vec<String>,
    pub approver_filters: Vec<Filter>,
    pub handler_filters: Vec<Filter>,
    pub observer_filters: Vec<Filter>,
    pub bypass_approval: bool,
}

/// Search path: test override directory, then `$XDG_DATA_HOME`-style
/// user data dir, then system data dirs, each joined with
/// `channel-dispatcher/clients/<name>.client`.
pub fn search_paths(user_data_dir: &Path, system_data_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(test_dir) = std::env::var(TEST_OVERRIDE_ENV) {
        dirs.push(PathBuf::from(test_dir));
    }
    dirs.push(user_data_dir.to_path_buf());
    dirs.extend(system_data_dirs.iter().cloned());
    dirs.into_iter().map(|d| d.join(SUBPATH)).collect()
}

/// Look for `<name>.client` across `dirs`, returning the first match.
pub fn find(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let filename = format!("{name}{SUFFIX}");
    dirs.iter().map(|d| d.join(&filename)).find(|p| p.is_file())
}

impl ClientDescriptor {
    pub fn parse(contents: &str) -> Result<Self, RegistryError> {
        let mut interfaces = Vec::new();
        let mut approver_filters: BTreeMap<usize, BTreeMap<String, Value>> = BTreeMap::new();
        let mut handler_filters: BTreeMap<usize, BTreeMap<String, Value>> = BTreeMap::new();
        let mut observer_filters: BTreeMap<usize, BTreeMap<String, Value>> = BTreeMap::new();
        let mut bypass_approval = false;

        let mut section: Option<(&'static str, usize)> = None;

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = parse_section_header(header);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match section {
                None => {
                    if key.eq_ignore_ascii_case("Interfaces") {
                        interfaces = value
                            .split([' ', ';'])
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string())
                            .collect();
                    }
                }
                Some((kind, index)) => {
                    if key.eq_ignore_ascii_case("BypassApproval") {
                        bypass_approval = value.eq_ignore_ascii_case("true");
                        continue;
                    }
                    let Some((name, code)) = key.rsplit_once(' ') else {
                        warn!(entry = %key, "client descriptor entry missing type code, dropping");
                        continue;
                    };
                    let Some(code_char) = code.chars().next().filter(|_| code.chars().count() == 1) else {
                        warn!(entry = %key, "client descriptor entry has malformed type code, dropping");
                        continue;
                    };
                    match Value::widen_from_code(code_char, value) {
                        Some(v) => {
                            let table = match kind {
                                "Approver" => &mut approver_filters,
                                "Handler" => &mut handler_filters,
                                "Observer" => &mut observer_filters,
                                _ => continue,
                            };
                            table.entry(index).or_default().insert(name.to_string(), v);
                        }
                        None => {
                            warn!(entry = %key, code = %code_char, "unknown client filter value type, dropping entry");
                        }
                    }
                }
            }
        }

        Ok(ClientDescriptor {
            interfaces,
            approver_filters: into_filters(approver_filters),
            handler_filters: into_filters(handler_filters),
            observer_filters: into_filters(observer_filters),
            bypass_approval,
        })
    }

    /// Serialise back to the same textual format, in a canonical
    /// (sorted) order, for the round-trip property in spec.md §8.
    pub fn to_canonical_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[ChannelDispatcher]");
        let _ = writeln!(out, "Interfaces={}", self.interfaces.join(";"));

        write_section(&mut out, "Approver", "ApproverChannelFilter", &self.approver_filters, false);
        write_section(&mut out, "Handler", "HandlerChannelFilter", &self.handler_filters, self.bypass_approval);
        write_section(&mut out, "Observer", "ObserverChannelFilter", &self.observer_filters, false);

        out
    }
}

fn parse_section_header(header: &str) -> Option<(&'static str, usize)> {
    let (prefix, index) = header.rsplit_once(' ')?;
    let index: usize = index.parse().ok()?;
    let kind = prefix.split('.').next()?;
    let kind = match kind {
        "Approver" => "Approver",
        "Handler" => "Handler",
        "Observer" => "Observer",
        _ => return None,
    };
    Some((kind, index))
}

fn into_filters(table: BTreeMap<usize, BTreeMap<String, Value>>) -> Vec<Filter> {
    table.into_values().map(Filter::new).collect()
}

fn write_section(out: &mut String, kind: &str, filter_kind: &str, filters: &[Filter], bypass_approval: bool) {
    for (index, filter) in filters.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "[{kind}.{filter_kind} {index}]");
        for (name, value) in filter.entries_sorted() {
            let _ = writeln!(out, "{name} {}={}", type_code(value), display_value(value));
        }
        if bypass_approval && index == 0 {
            let _ = writeln!(out, "BypassApproval=true");
        }
    }
}

fn type_code(value: &Value) -> char {
    match value {
        Value::Str(_) => 's',
        Value::ObjectPath(_) => 'o',
        Value::Bool(_) => 'b',
        Value::Int(_) => 'x',
        Value::UInt(_) => 't',
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Str(s) | Value::ObjectPath(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interfaces_and_a_handler_filter_with_bypass() {
        let text = "\
[ChannelDispatcher]
Interfaces=Handler;Observer

[Handler.HandlerChannelFilter 0]
type s=text
BypassApproval=true

[Observer.ObserverChannelFilter 0]
";
        let d = ClientDescriptor::parse(text).unwrap();
        assert_eq!(d.interfaces, vec!["Handler", "Observer"]);
        assert_eq!(d.handler_filters.len(), 1);
        assert_eq!(d.handler_filters[0].len(), 1);
        assert!(d.bypass_approval);
        assert_eq!(d.observer_filters.len(), 1);
        assert!(d.observer_filters[0].is_empty());
    }

    #[test]
    fn unknown_type_code_drops_entry_not_client() {
        let text = "\
[ChannelDispatcher]
Interfaces=Approver

[Approver.ApproverChannelFilter 0]
type s=text
weird z=???
";
        let d = ClientDescriptor::parse(text).unwrap();
        assert_eq!(d.approver_filters[0].len(), 1);
    }

    #[test]
    fn round_trip_preserves_capabilities_and_filters() {
        let mut entries = BTreeMap::new();
        entries.insert("type".to_string(), Value::Str("text".into()));
        entries.insert("urgent".to_string(), Value::Bool(true));
        let original = ClientDescriptor {
            interfaces: vec!["Handler".to_string()],
            approver_filters: Vec::new(),
            handler_filters: vec![Filter::new(entries)],
            observer_filters: Vec::new(),
            bypass_approval: true,
        };

        let text = original.to_canonical_string();
        let reparsed = ClientDescriptor::parse(&text).unwrap();

        assert_eq!(reparsed.interfaces, original.interfaces);
        assert_eq!(reparsed.bypass_approval, original.bypass_approval);
        assert_eq!(reparsed.handler_filters, original.handler_filters);
    }
}
