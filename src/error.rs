//! Unified error handling for the channel dispatcher.
//!
//! Mirrors the split the rest of the daemon uses: one error enum per
//! subsystem, `thiserror` derives for display/`From` plumbing, and
//! `anyhow::Result` only at the process boundary.

use thiserror::Error;

use crate::bus::BusError;

/// Errors raised while discovering or describing a client.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("bus error while querying client {name}: {source}")]
    Bus { name: String, source: BusError },

    #[error("client descriptor {path} is malformed: {reason}")]
    MalformedDescriptor { path: String, reason: String },

    #[error("client {0} declared no recognised capabilities")]
    NoCapabilities(String),
}

/// Errors raised while walking a batch through the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request was aborted by its owner with the cancellation error.
    #[error("dispatch cancelled")]
    Cancelled,

    /// No client's filters matched any channel in the batch.
    #[error("no handler matches channel")]
    NoHandler,

    /// An internal filter hook rejected or failed the batch.
    #[error("internal filter chain rejected the batch: {0}")]
    FilterRejected(String),

    /// The channel at the head of this context is no longer available.
    #[error("channel is not available")]
    NotAvailable,

    /// The chosen handler returned an error when invoked.
    ///
    /// Per spec this is a known limitation: the channel is marked failed
    /// and is not automatically retried against a different handler.
    #[error("handler {handler} failed to accept channel: {reason}")]
    HandlerFailed { handler: String, reason: String },

    /// A loop of leftover-channel re-dispatch made no progress.
    #[error("leftover channels could not be assigned to any handler")]
    NoProgress,
}

impl DispatchError {
    /// Stable, low-cardinality label for the `channel_dispatcher_channels_failed_total` metric.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::Cancelled => "cancelled",
            DispatchError::NoHandler => "no_handler",
            DispatchError::FilterRejected(_) => "filter_rejected",
            DispatchError::NotAvailable => "not_available",
            DispatchError::HandlerFailed { .. } => "handler_failed",
            DispatchError::NoProgress => "no_progress",
        }
    }
}

/// Errors raised by [`crate::operation::DispatchOperation`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("dispatch operation already finished")]
    AlreadyFinished,

    #[error("handler {0} does not match any possible handler for this operation")]
    UnknownHandler(String),
}

/// Errors raised by the request entry point ([`crate::request`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("account {0} does not exist")]
    UnknownAccount(String),

    #[error("preferred handler bus name {0:?} is not syntactically valid")]
    InvalidHandlerName(String),

    #[error("channel construction failed: {0}")]
    ChannelConstruction(String),
}
