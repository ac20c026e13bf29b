//! Dispatch Operation: §4.4.
//!
//! The externally-visible, approver-facing object exposed during the
//! approval phase of a [`crate::dispatch::DispatchContext`]. Supports
//! `Claim` and `HandleWith`, and tracks a finish-blocked counter so its
//! `finished` transition waits for every in-flight approver call to
//! return before firing.

use uuid::Uuid;

use crate::channel::ChannelPath;
use crate::error::OperationError;

/// The operation's state machine: `pending -> (claimed | handle-with) -> finished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Claimed,
    HandleWith(Option<String>),
}

/// An in-progress, unapproved dispatch exposed to approvers.
#[derive(Debug, Clone)]
pub struct DispatchOperation {
    pub path: String,
    pub channels: Vec<ChannelPath>,
    pub possible_handlers: Vec<String>,
    state: OperationState,
    finished: bool,
    finish_blocked: u32,
}

impl DispatchOperation {
    pub fn new(channels: Vec<ChannelPath>, possible_handlers: Vec<String>) -> Self {
        Self {
            path: format!("/org/example/ChannelDispatcher/Operation{}", Uuid::new_v4().simple()),
            channels,
            possible_handlers,
            state: OperationState::Pending,
            finished: false,
            finish_blocked: 0,
        }
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// An approver call is in flight; its reply must not let `finished`
    /// fire until it (and every other concurrent call) returns.
    pub fn block_finish(&mut self) {
        self.finish_blocked += 1;
    }

    /// An approver call returned. Returns `true` if this was the call
    /// that allowed a pending decision to finally finish.
    pub fn unblock_finish(&mut self) -> bool {
        debug_assert!(self.finish_blocked > 0);
        self.finish_blocked = self.finish_blocked.saturating_sub(1);
        self.maybe_finish()
    }

    /// `HandleWith(name)`: an empty name means "any matching handler".
    pub fn handle_with(&mut self, handler: Option<String>) -> Result<bool, OperationError> {
        if self.finished {
            return Err(OperationError::AlreadyFinished);
        }
        if let Some(name) = &handler {
            if !self.possible_handlers.iter().any(|h| h == name) {
                return Err(OperationError::UnknownHandler(name.clone()));
            }
        }
        self.state = OperationState::HandleWith(handler);
        Ok(self.maybe_finish())
    }

    /// `Claim()`: the approver takes responsibility; no handler runs.
    pub fn claim(&mut self) -> Result<bool, OperationError> {
        if self.finished {
            return Err(OperationError::AlreadyFinished);
        }
        self.state = OperationState::Claimed;
        Ok(self.maybe_finish())
    }

    fn maybe_finish(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let decided = !matches!(self.state, OperationState::Pending);
        if decided && self.finish_blocked == 0 {
            self.finished = true;
            true
        } else {
            false
        }
    }
}
