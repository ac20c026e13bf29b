//! The [`Client`] entity and its capability set.

use crate::channel::ChannelPath;
use crate::filter::Filter;

/// A client's capability union, modelled as a flat record rather than
/// a class hierarchy, per the design notes: dispatch is done by
/// pattern-matching on these flags, not by dynamic dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub observer: bool,
    pub approver: bool,
    pub handler: bool,
    pub requests: bool,
}

impl Capabilities {
    pub fn any(&self) -> bool {
        self.observer || self.approver || self.handler || self.requests
    }
}

/// An external process registered on the bus under a well-known name.
#[derive(Debug, Clone)]
pub struct Client {
    pub bus_name: String,
    pub capabilities: Capabilities,
    pub observer_filters: Vec<Filter>,
    pub approver_filters: Vec<Filter>,
    pub handler_filters: Vec<Filter>,
    pub bypass_approval: bool,
    /// Survives bus disappearance; non-activatable clients are
    /// garbage-collected the moment they drop off the bus.
    pub activatable: bool,
    pub alive: bool,
    /// Cached from `HandledChannels`; cleared when an activatable
    /// client goes inactive (spec.md §4.1 "Name-owner events").
    pub handled_channels: Vec<ChannelPath>,
}

impl Client {
    pub fn new(bus_name: String, activatable: bool, alive: bool) -> Self {
        Self {
            bus_name,
            capabilities: Capabilities::default(),
            observer_filters: Vec::new(),
            approver_filters: Vec::new(),
            handler_filters: Vec::new(),
            bypass_approval: false,
            activatable,
            alive,
            handled_channels: Vec::new(),
        }
    }

    pub fn filters_for(&self, capability: CapabilityKind) -> &[Filter] {
        match capability {
            CapabilityKind::Observer => &self.observer_filters,
            CapabilityKind::Approver => &self.approver_filters,
            CapabilityKind::Handler => &self.handler_filters,
        }
    }

    pub fn has(&self, capability: CapabilityKind) -> bool {
        match capability {
            CapabilityKind::Observer => self.capabilities.observer,
            CapabilityKind::Approver => self.capabilities.approver,
            CapabilityKind::Handler => self.capabilities.handler,
        }
    }
}

/// One of the three filterable capabilities (Requests carries no
/// filter list of its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Observer,
    Approver,
    Handler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_any_is_false_when_all_unset() {
        assert!(!Capabilities::default().any());
    }

    #[test]
    fn filters_for_dispatches_on_capability_kind() {
        let mut client = Client::new("org.example.H".into(), false, true);
        client.handler_filters.push(Filter::empty());
        assert_eq!(client.filters_for(CapabilityKind::Handler).len(), 1);
        assert_eq!(client.filters_for(CapabilityKind::Observer).len(), 0);
    }
}
