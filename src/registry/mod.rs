//! Client Registry: §4.1.
//!
//! Maintains `{bus-name -> Client}` for every well-known name under a
//! fixed prefix, tolerating clients coming and going on the bus.

pub mod client;
pub mod descriptor;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::bus::{BusConnection, NameOwnerChange, RawFilter};
use crate::error::RegistryError;
use crate::filter::Filter;
use crate::value::Value;

pub use client::{CapabilityKind, Capabilities, Client};

/// Registry of every client known under `prefix`.
pub struct ClientRegistry {
    prefix: String,
    bus: Arc<dyn BusConnection>,
    search_dirs: Vec<PathBuf>,
    clients: DashMap<String, Client>,
}

impl ClientRegistry {
    pub fn new(bus: Arc<dyn BusConnection>, prefix: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            bus,
            search_dirs,
            clients: DashMap::new(),
        }
    }

    /// Boot sequence (§4.1): query activatable names, then owned
    /// names, discovering metadata for each newly-seen client.
    pub async fn bootstrap(&self) -> Result<(), RegistryError> {
        for name in self.bus.list_activatable_names(&self.prefix).await.map_err(|source| {
            RegistryError::Bus { name: self.prefix.clone(), source }
        })? {
            self.discover(&name, true, false).await?;
        }

        for name in self.bus.list_owned_names(&self.prefix).await.map_err(|source| {
            RegistryError::Bus { name: self.prefix.clone(), source }
        })? {
            if let Some(mut existing) = self.clients.get_mut(&name) {
                existing.alive = true;
                continue;
            }
            self.discover(&name, false, true).await?;
        }

        crate::metrics::CLIENTS_KNOWN.set(self.clients.len() as i64);
        info!(count = self.clients.len(), "client registry bootstrap complete");
        Ok(())
    }

    /// Learn about a client for the first time: descriptor file first,
    /// bus query as a fallback.
    async fn discover(&self, name: &str, activatable: bool, alive: bool) -> Result<(), RegistryError> {
        let descriptor = descriptor::find(name, &self.search_dirs)
            .and_then(|path| std::fs::read_to_string(&path).ok().map(|text| (path, text)));

        let mut client = Client::new(name.to_string(), activatable, alive);

        match descriptor {
            Some((path, text)) => {
                let parsed = descriptor::ClientDescriptor::parse(&text).map_err(|e| match e {
                    RegistryError::MalformedDescriptor { reason, .. } => RegistryError::MalformedDescriptor {
                        path: path.display().to_string(),
                        reason,
                    },
                    other => other,
                })?;
                apply_interfaces(&mut client, &parsed.interfaces);
                client.observer_filters = parsed.observer_filters;
                client.approver_filters = parsed.approver_filters;
                client.handler_filters = parsed.handler_filters;
                client.bypass_approval = parsed.bypass_approval;
                debug!(client = %name, path = %path.display(), "loaded client descriptor from disk");
            }
            None => {
                let raw = self
                    .bus
                    .client_properties(name)
                    .await
                    .map_err(|source| RegistryError::Bus { name: name.to_string(), source })?;
                apply_interfaces(&mut client, &raw.interfaces);
                client.observer_filters = normalize_filters(name, "Observer", &raw.observer_filters);
                client.approver_filters = normalize_filters(name, "Approver", &raw.approver_filters);
                client.handler_filters = normalize_filters(name, "Handler", &raw.handler_filters);
                client.bypass_approval = raw.bypass_approval;
            }
        }

        if !client.capabilities.any() {
            return Err(RegistryError::NoCapabilities(name.to_string()));
        }

        self.clients.insert(name.to_string(), client);
        Ok(())
    }

    /// Apply a name-owner-changed notification per spec.md §4.1.
    pub async fn handle_name_owner_change(&self, change: NameOwnerChange) {
        if !change.name.starts_with(&self.prefix) {
            return;
        }

        match (&change.old_owner, &change.new_owner) {
            (None, Some(_)) => {
                if let Some(mut existing) = self.clients.get_mut(&change.name) {
                    existing.alive = true;
                } else if let Err(e) = self.discover(&change.name, false, true).await {
                    warn!(client = %change.name, error = %e, "failed to discover newly-owned client");
                }
            }
            (Some(_), None) => self.handle_disappearance(&change.name),
            (Some(old), Some(new)) if old != new => {
                warn!(
                    client = %change.name,
                    old_owner = %old,
                    new_owner = %new,
                    "bus name ownership transferred directly; treating as disappearance then appearance"
                );
                self.handle_disappearance(&change.name);
                if let Err(e) = self.discover(&change.name, false, true).await {
                    warn!(client = %change.name, error = %e, "failed to rediscover client after ownership transfer");
                }
            }
            _ => {}
        }
    }

    fn handle_disappearance(&self, name: &str) {
        let Some(mut entry) = self.clients.get_mut(name) else {
            return;
        };
        if entry.activatable {
            entry.alive = false;
            entry.handled_channels.clear();
        } else {
            drop(entry);
            self.clients.remove(name);
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, name: &str) -> Option<Client> {
        self.clients.get(name).map(|c| c.value().clone())
    }

    pub fn set_handled_channels(&self, name: &str, channels: Vec<crate::channel::ChannelPath>) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.handled_channels = channels;
        }
    }

    /// All currently-alive clients implementing `capability`.
    pub fn active_with(&self, capability: CapabilityKind) -> Vec<Client> {
        self.clients
            .iter()
            .filter(|c| c.alive && c.has(capability))
            .map(|c| c.value().clone())
            .collect()
    }

    /// All currently-alive handlers, used by the recovery subsystem.
    pub fn active_handlers(&self) -> Vec<Client> {
        self.active_with(CapabilityKind::Handler)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn apply_interfaces(client: &mut Client, interfaces: &[String]) {
    for iface in interfaces {
        match iface.as_str() {
            "Observer" => client.capabilities.observer = true,
            "Approver" => client.capabilities.approver = true,
            "Handler" => client.capabilities.handler = true,
            "Requests" => client.capabilities.requests = true,
            other => warn!(interface = %other, "unrecognised capability interface, ignoring"),
        }
    }
}

fn normalize_filters(client: &str, kind: &str, raw: &[RawFilter]) -> Vec<Filter> {
    raw.iter()
        .map(|entries| {
            let mut normalized = BTreeMap::new();
            for (name, (code, text)) in entries {
                match Value::widen_from_code(*code, text) {
                    Some(v) => {
                        normalized.insert(name.clone(), v);
                    }
                    None => warn!(
                        client = %client,
                        kind = %kind,
                        property = %name,
                        code = %code,
                        "unknown client property value type, dropping filter entry"
                    ),
                }
            }
            Filter::new(normalized)
        })
        .collect()
}

/// Convenience used by tests to build a [`RawClientProperties`] inline.
#[cfg(test)]
pub(crate) fn raw_filter(entries: &[(&str, char, &str)]) -> RawFilter {
    entries
        .iter()
        .map(|(name, code, value)| (name.to_string(), (*code, value.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::bus::RawClientProperties;

    fn handler_properties(filter: RawFilter) -> RawClientProperties {
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![filter],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_discovers_owned_and_activatable_clients() {
        let bus = FakeBus::new();
        bus.register_owned("org.example.H1", handler_properties(raw_filter(&[("type", 's', "text")])));
        bus.register_activatable("org.example.H2", handler_properties(RawFilter::new()));

        let registry = ClientRegistry::new(bus, "org.example.", Vec::new());
        registry.bootstrap().await.unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("org.example.H1").unwrap().alive);
        assert!(!registry.get("org.example.H2").unwrap().alive);
    }

    #[tokio::test]
    async fn activatable_client_disappearance_keeps_filters() {
        let bus = FakeBus::new();
        bus.register_owned("org.example.H1", handler_properties(raw_filter(&[("type", 's', "text")])));

        let registry = ClientRegistry::new(bus, "org.example.", Vec::new());
        registry.discover("org.example.H1", true, true).await.unwrap();

        registry
            .handle_name_owner_change(NameOwnerChange {
                name: "org.example.H1".to_string(),
                old_owner: Some(":1.1".to_string()),
                new_owner: None,
            })
            .await;

        let client = registry.get("org.example.H1").unwrap();
        assert!(!client.alive);
        assert_eq!(client.handler_filters.len(), 1);
    }

    #[tokio::test]
    async fn non_activatable_client_disappearance_is_forgotten() {
        let bus = FakeBus::new();
        bus.register_owned("org.example.H1", handler_properties(RawFilter::new()));

        let registry = ClientRegistry::new(bus, "org.example.", Vec::new());
        registry.discover("org.example.H1", false, true).await.unwrap();

        registry
            .handle_name_owner_change(NameOwnerChange {
                name: "org.example.H1".to_string(),
                old_owner: Some(":1.1".to_string()),
                new_owner: None,
            })
            .await;

        assert!(registry.get("org.example.H1").is_none());
    }

    #[tokio::test]
    async fn unknown_value_type_drops_entry_but_keeps_client() {
        let bus = FakeBus::new();
        bus.register_owned(
            "org.example.H1",
            handler_properties(raw_filter(&[("type", 's', "text"), ("weird", 'z', "???")])),
        );

        let registry = ClientRegistry::new(bus, "org.example.", Vec::new());
        registry.discover("org.example.H1", false, true).await.unwrap();

        let client = registry.get("org.example.H1").unwrap();
        assert_eq!(client.handler_filters[0].len(), 1);
    }
}
