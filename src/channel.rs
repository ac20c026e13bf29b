//! Channel entity.
//!
//! A channel is opaque to the dispatcher beyond its identity, its typed
//! metadata, and its status in the pipeline. Connection managers and
//! account layers construct channels; only the pipeline mutates them.

use chrono::{DateTime, Utc};

use crate::error::DispatchError;
use crate::value::{PropertyMap, Value};

/// Unique identity of a channel: its bus object path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelPath(pub String);

impl std::fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a channel currently sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created by the request path, not yet handed to a context.
    Request,
    /// Accepted as a request; waiting to be claimed by `take_channels`.
    Requested,
    /// In a [`crate::dispatch::DispatchContext`], walking the pipeline.
    Dispatching,
    /// The chosen handler has been called and has not yet replied.
    HandlerInvoked,
    /// Terminal: a handler (or an approver's `Claim`) has taken it.
    Dispatched,
    /// Terminal: the channel could not be dispatched.
    Failed,
}

/// One conversational context: a text room, call, or file transfer.
#[derive(Debug, Clone)]
pub struct Channel {
    pub path: ChannelPath,
    pub properties: PropertyMap,
    /// True if this channel exists because *this process* asked for it.
    pub requested: bool,
    /// `user_action_time` values of every request this channel has
    /// satisfied, latest-first is not guaranteed; see
    /// [`Channel::merge_request`].
    satisfied_requests: Vec<i64>,
    pub status: ChannelStatus,
    pub error: Option<DispatchError>,
    /// Bus name of a handler the requester asked for, if any.
    pub preferred_handler: Option<String>,
    /// Bus name of the handler actually holding this channel once
    /// `Dispatched`. `None` for a `Claim`ed channel, where an approver
    /// took responsibility without any handler being invoked.
    pub handled_by: Option<String>,
    pub user_action_time: i64,
}

impl Channel {
    pub fn new(path: ChannelPath, properties: PropertyMap) -> Self {
        Self {
            path,
            properties,
            requested: false,
            satisfied_requests: Vec::new(),
            status: ChannelStatus::Request,
            error: None,
            preferred_handler: None,
            handled_by: None,
            user_action_time: 0,
        }
    }

    pub fn requested(path: ChannelPath, properties: PropertyMap, preferred_handler: Option<String>) -> Self {
        let mut c = Self::new(path, properties);
        c.requested = true;
        c.preferred_handler = preferred_handler;
        c.status = ChannelStatus::Requested;
        c
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Record that a new request has been satisfied by this (already
    /// dispatched) channel, resolving the "more than one request"
    /// question from spec.md §9: the user-action-time surfaced to the
    /// handler is the latest non-zero value among all satisfied
    /// requests.
    pub fn merge_request(&mut self, user_action_time: i64) {
        if user_action_time != 0 {
            self.satisfied_requests.push(user_action_time);
        }
        self.user_action_time = self.latest_user_action_time();
    }

    fn latest_user_action_time(&self) -> i64 {
        self.satisfied_requests.iter().copied().max().unwrap_or(0)
    }

    pub fn mark_failed(&mut self, error: DispatchError) {
        self.status = ChannelStatus::Failed;
        self.error = Some(error);
    }

    /// `handler` is `None` when an approver `Claim`ed the channel
    /// directly rather than a handler accepting it.
    pub fn mark_dispatched(&mut self, handler: Option<String>) {
        self.status = ChannelStatus::Dispatched;
        self.error = None;
        self.handled_by = handler;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ChannelStatus::Dispatched | ChannelStatus::Failed)
    }
}

/// Timestamp helper shared by the request entry point and recovery
/// subsystem for diagnostics; not part of the channel's own state.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ChannelPath {
        ChannelPath(p.to_string())
    }

    #[test]
    fn latest_nonzero_user_action_time_wins() {
        let mut c = Channel::new(path("/c1"), PropertyMap::new());
        c.merge_request(0);
        c.merge_request(42);
        c.merge_request(17);
        assert_eq!(c.user_action_time, 42);
    }

    #[test]
    fn zero_only_requests_keep_zero() {
        let mut c = Channel::new(path("/c1"), PropertyMap::new());
        c.merge_request(0);
        c.merge_request(0);
        assert_eq!(c.user_action_time, 0);
    }

    #[test]
    fn fresh_channel_is_not_terminal() {
        let c = Channel::new(path("/c1"), PropertyMap::new());
        assert!(!c.is_terminal());
    }

    #[test]
    fn failed_and_dispatched_are_terminal() {
        let mut c = Channel::new(path("/c1"), PropertyMap::new());
        c.mark_failed(DispatchError::NoHandler);
        assert!(c.is_terminal());

        let mut d = Channel::new(path("/c2"), PropertyMap::new());
        d.mark_dispatched(Some("org.example.H1".to_string()));
        assert!(d.is_terminal());
    }
}
