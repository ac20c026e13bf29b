//! Message bus abstraction.
//!
//! spec.md's non-goals exclude specifying the wire protocol spoken
//! between the dispatcher and its clients, so this module only
//! describes the *shape* of the calls the dispatcher makes and
//! receives: property reads, the handful of client-facing calls
//! (`observe_channels`, `add_dispatch_operation`, `handle_channels`,
//! `add_request`, `remove_request`), and name-owner change
//! notifications. [`fake`] provides a deterministic in-process
//! implementation used by tests and the demo binary; a real transport
//! would implement the same trait.

pub mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::channel::ChannelPath;
use crate::value::PropertyMap;

/// Errors a bus implementation can raise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no reply from {0}")]
    NoReply(String),

    #[error("client {0} does not implement the requested interface")]
    InterfaceMissing(String),

    #[error("{0}")]
    Other(String),
}

/// An approver's reply to `add_dispatch_operation`. Real approvers
/// decide by calling `Claim`/`HandleWith` back on the operation object
/// at their own pace; this trait collapses that into the call's
/// return value, which is enough to drive
/// [`crate::operation::DispatchOperation`]'s state machine faithfully
/// without inventing a concrete wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApproverDecision {
    Claim,
    #[default]
    HandleWith(Option<String>),
}

/// A name-owner-changed notification, as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChange {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

/// A single raw filter entry as read off the bus: the type code the
/// remote side declared the value with (see
/// [`crate::value::Value::widen_from_code`]) plus its textual form.
pub type RawEntry = (char, String);

/// One filter's worth of raw entries, keyed by property name.
pub type RawFilter = BTreeMap<String, RawEntry>;

/// Declared capability filter lists and flags for one client, as read
/// straight off the bus (pre-registry-normalisation happens in
/// [`crate::registry`]).
#[derive(Debug, Clone, Default)]
pub struct RawClientProperties {
    pub interfaces: Vec<String>,
    pub approver_filters: Vec<RawFilter>,
    pub handler_filters: Vec<RawFilter>,
    pub observer_filters: Vec<RawFilter>,
    pub bypass_approval: bool,
}

/// The operations the dispatcher performs against the bus: discovery,
/// per-client calls, and exposing its own `DispatchOperations`
/// surface.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Request the dispatcher's well-known name. Fails the whole
    /// process per spec.md §7 "Bus name refused".
    async fn request_name(&self, name: &str) -> Result<(), BusError>;

    async fn list_activatable_names(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    async fn list_owned_names(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    /// Fetch the raw (un-normalised) capability/filter declaration for
    /// a client, either from its descriptor file or by querying the
    /// bus directly; see [`crate::registry::descriptor`].
    async fn client_properties(&self, name: &str) -> Result<RawClientProperties, BusError>;

    async fn observe_channels(
        &self,
        client: &str,
        channels: &[ChannelPath],
    ) -> Result<(), BusError>;

    async fn add_dispatch_operation(
        &self,
        client: &str,
        operation_path: &str,
        properties: &PropertyMap,
    ) -> Result<ApproverDecision, BusError>;

    async fn handle_channels(
        &self,
        client: &str,
        channels: &[ChannelPath],
    ) -> Result<(), BusError>;

    async fn add_request(&self, client: &str, request_path: &str) -> Result<(), BusError>;

    async fn remove_request(&self, client: &str, request_path: &str) -> Result<(), BusError>;

    /// Bus names with the `HandledChannels` property, used by
    /// [`crate::recovery`] at startup.
    async fn handled_channels(&self, client: &str) -> Result<Vec<ChannelPath>, BusError>;
}
