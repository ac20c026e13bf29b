//! Deterministic in-process bus used by tests and the demo binary.
//!
//! Scripts per-client responses and records every call the dispatcher
//! makes, so pipeline tests can assert call order without a real
//! transport.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ApproverDecision, BusConnection, BusError, RawClientProperties, RawFilter};
use crate::channel::ChannelPath;
use crate::value::PropertyMap;

/// One recorded call made by the dispatcher against a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Observe { client: String, channels: Vec<String> },
    AddDispatchOperation { client: String, operation_path: String },
    Handle { client: String, channels: Vec<String> },
    AddRequest { client: String, request_path: String },
    RemoveRequest { client: String, request_path: String },
}

#[derive(Default)]
struct ClientScript {
    properties: RawClientProperties,
    handled_channels: Vec<ChannelPath>,
    observe_fails: bool,
    handle_fails: Option<String>,
    add_dispatch_operation_fails: bool,
    approver_decision: ApproverDecision,
}

/// In-process stand-in for a real bus connection.
pub struct FakeBus {
    activatable: Mutex<Vec<String>>,
    owned: Mutex<Vec<String>>,
    clients: DashMap<String, ClientScript>,
    calls: Mutex<Vec<Call>>,
    name_taken: Mutex<bool>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            activatable: Mutex::new(Vec::new()),
            owned: Mutex::new(Vec::new()),
            clients: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            name_taken: Mutex::new(false),
        })
    }

    pub fn with_name_already_taken() -> Arc<Self> {
        let bus = Self::new();
        *bus.name_taken.lock() = true;
        bus
    }

    /// Register a client as currently owning its name on the bus, with
    /// the given raw capability declaration.
    pub fn register_owned(&self, name: &str, properties: RawClientProperties) {
        self.owned.lock().push(name.to_string());
        self.clients.insert(
            name.to_string(),
            ClientScript {
                properties,
                ..Default::default()
            },
        );
    }

    pub fn register_activatable(&self, name: &str, properties: RawClientProperties) {
        self.activatable.lock().push(name.to_string());
        self.clients.insert(
            name.to_string(),
            ClientScript {
                properties,
                ..Default::default()
            },
        );
    }

    pub fn set_handled_channels(&self, name: &str, channels: Vec<ChannelPath>) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.handled_channels = channels;
        }
    }

    pub fn script_observe_failure(&self, name: &str) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.observe_fails = true;
        }
    }

    pub fn script_handle_failure(&self, name: &str, reason: &str) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.handle_fails = Some(reason.to_string());
        }
    }

    pub fn script_add_dispatch_operation_failure(&self, name: &str) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.add_dispatch_operation_fails = true;
        }
    }

    /// Script the decision an approver returns alongside its
    /// `add_dispatch_operation` reply. Defaults to `HandleWith(None)`
    /// ("any matching handler") if never called.
    pub fn script_approver_decision(&self, name: &str, decision: ApproverDecision) {
        if let Some(mut entry) = self.clients.get_mut(name) {
            entry.approver_decision = decision;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

fn clone_filter(filter: &RawFilter) -> RawFilter {
    filter.clone()
}

#[async_trait]
impl BusConnection for FakeBus {
    async fn request_name(&self, _name: &str) -> Result<(), BusError> {
        if *self.name_taken.lock() {
            Err(BusError::Other("name already owned".into()))
        } else {
            Ok(())
        }
    }

    async fn list_activatable_names(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .activatable
            .lock()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_owned_names(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .owned
            .lock()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn client_properties(&self, name: &str) -> Result<RawClientProperties, BusError> {
        self.clients
            .get(name)
            .map(|e| RawClientProperties {
                interfaces: e.properties.interfaces.clone(),
                approver_filters: e.properties.approver_filters.iter().map(clone_filter).collect(),
                handler_filters: e.properties.handler_filters.iter().map(clone_filter).collect(),
                observer_filters: e.properties.observer_filters.iter().map(clone_filter).collect(),
                bypass_approval: e.properties.bypass_approval,
            })
            .ok_or_else(|| BusError::NoReply(name.to_string()))
    }

    async fn observe_channels(&self, client: &str, channels: &[ChannelPath]) -> Result<(), BusError> {
        tokio::task::yield_now().await;
        self.record(Call::Observe {
            client: client.to_string(),
            channels: channels.iter().map(|c| c.0.clone()).collect(),
        });
        let fails = self.clients.get(client).map(|e| e.observe_fails).unwrap_or(false);
        if fails {
            Err(BusError::Other("observer declined".into()))
        } else {
            Ok(())
        }
    }

    async fn add_dispatch_operation(
        &self,
        client: &str,
        operation_path: &str,
        _properties: &PropertyMap,
    ) -> Result<ApproverDecision, BusError> {
        tokio::task::yield_now().await;
        self.record(Call::AddDispatchOperation {
            client: client.to_string(),
            operation_path: operation_path.to_string(),
        });
        let entry = self.clients.get(client);
        let fails = entry.as_ref().map(|e| e.add_dispatch_operation_fails).unwrap_or(false);
        if fails {
            return Err(BusError::Other("approver declined operation".into()));
        }
        Ok(entry.map(|e| e.approver_decision.clone()).unwrap_or_default())
    }

    async fn handle_channels(&self, client: &str, channels: &[ChannelPath]) -> Result<(), BusError> {
        self.record(Call::Handle {
            client: client.to_string(),
            channels: channels.iter().map(|c| c.0.clone()).collect(),
        });
        let failure = self.clients.get(client).and_then(|e| e.handle_fails.clone());
        match failure {
            Some(reason) => Err(BusError::Other(reason)),
            None => Ok(()),
        }
    }

    async fn add_request(&self, client: &str, request_path: &str) -> Result<(), BusError> {
        self.record(Call::AddRequest {
            client: client.to_string(),
            request_path: request_path.to_string(),
        });
        Ok(())
    }

    async fn remove_request(&self, client: &str, request_path: &str) -> Result<(), BusError> {
        self.record(Call::RemoveRequest {
            client: client.to_string(),
            request_path: request_path.to_string(),
        });
        Ok(())
    }

    async fn handled_channels(&self, client: &str) -> Result<Vec<ChannelPath>, BusError> {
        Ok(self
            .clients
            .get(client)
            .map(|e| e.handled_channels.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let bus = FakeBus::new();
        bus.register_owned("org.example.H1", RawClientProperties::default());

        bus.observe_channels(
            "org.example.H1",
            &[ChannelPath("/c1".into())],
        )
        .await
        .unwrap();
        bus.handle_channels("org.example.H1", &[ChannelPath("/c1".into())])
            .await
            .unwrap();

        assert_eq!(bus.calls().len(), 2);
        assert!(matches!(bus.calls()[0], Call::Observe { .. }));
        assert!(matches!(bus.calls()[1], Call::Handle { .. }));
    }

    #[tokio::test]
    async fn name_already_taken_fails_request() {
        let bus = FakeBus::with_name_already_taken();
        assert!(bus.request_name("org.example.Dispatcher").await.is_err());
    }
}
