//! Dispatch Context and Pipeline Engine: §4.3.
//!
//! [`DispatchContext`] is the per-batch state object that walks a
//! channel set through the staged pipeline (internal filters ->
//! observers -> approvers -> handlers). [`pipeline::run`] drives it.

pub mod lock;
pub mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::filter::RankedHandler;
use lock::ClientLockCounter;

/// Where a context currently sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InternalFilters,
    Observers,
    Approvers,
    Handlers,
    Done,
}

/// Per-batch state that walks a non-empty channel set through the
/// pipeline. One context exists per call to `take_channels`, except
/// for the single-channel bypass contexts the re-invocation path
/// creates (see [`crate::dispatcher::Dispatcher::redeliver`]).
pub struct DispatchContext {
    pub account: String,
    pub channels: Vec<Channel>,
    /// Ranked by [`crate::filter::rank_handlers`]; empty only for
    /// contexts that bypass the ranking entirely (re-invocation).
    pub possible_handlers: Vec<RankedHandler>,
    pub phase: Phase,
    pub locks: ClientLockCounter,
    pub approvers_invoked: u32,
    pub approvers_failed: u32,
    /// Set by an internal filter hook signalling "cancel".
    pub cancelled: bool,
    /// Set externally, e.g. by [`crate::dispatcher::Dispatcher::cancel`],
    /// while the pipeline is running. Checked at phase boundaries since
    /// nothing here preempts an in-flight bus call.
    pub cancel_flag: Arc<AtomicBool>,
    pub skip_approval: bool,
    /// Handler chosen by an approver's `HandleWith`, or by the
    /// re-invocation bypass path. Overrides ranking when present.
    pub selected_handler_override: Option<String>,
}

impl DispatchContext {
    pub fn new(account: String, channels: Vec<Channel>, possible_handlers: Vec<RankedHandler>) -> Self {
        assert!(!channels.is_empty(), "a dispatch context requires at least one channel");
        Self {
            account,
            channels,
            possible_handlers,
            phase: Phase::InternalFilters,
            locks: ClientLockCounter::new(),
            approvers_invoked: 0,
            approvers_failed: 0,
            cancelled: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            skip_approval: false,
            selected_handler_override: None,
        }
    }

    /// True once every channel has reached a terminal status
    /// (Dispatched or Failed) — the context's completion condition.
    pub fn is_complete(&self) -> bool {
        self.channels.iter().all(Channel::is_terminal)
    }

    pub fn requested_only(&self) -> bool {
        self.channels.iter().all(|c| c.requested)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled || self.cancel_flag.load(Ordering::SeqCst)
    }
}
