//! Pipeline Engine: §4.3 stage-by-stage implementation.
//!
//! [`run`] drives one [`DispatchContext`] through internal filters,
//! observers, approvers, and the handler, returning the context once
//! every channel has reached a terminal status.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{DispatchContext, Phase};
use crate::bus::{ApproverDecision, BusConnection};
use crate::channel::{ChannelPath, ChannelStatus};
use crate::dispatcher::{operation_properties, LiveOperation, Notification, NotificationHub};
use crate::error::DispatchError;
use crate::filter::best_score;
use crate::operation::{DispatchOperation, OperationState};
use crate::registry::{CapabilityKind, Client, ClientRegistry};

/// Outcome of one internal filter hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalOutcome {
    Continue,
    Cancel,
    Reject(String),
    /// A single channel is no longer available. Unlike `Cancel`, this
    /// is fatal only for that channel; the context continues with the
    /// rest of the batch.
    Unavailable(ChannelPath),
}

/// An in-process hook run, in priority order, before any client is
/// contacted. `Cancel`/`Reject` abort the whole batch; `Unavailable`
/// fails just the named channel and the chain keeps running.
#[async_trait]
pub trait InternalFilter: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, ctx: &DispatchContext) -> InternalOutcome;
}

/// Everything the pipeline needs from the rest of the crate, bundled
/// so `run` doesn't grow an unwieldy parameter list.
pub struct PipelineDeps<'a> {
    pub registry: &'a ClientRegistry,
    pub bus: &'a Arc<dyn BusConnection>,
    pub internal_filters: &'a [Box<dyn InternalFilter>],
    pub notifications: &'a NotificationHub,
    pub live_operations: &'a DashMap<String, LiveOperation>,
}

/// Drive `ctx` through every pipeline stage and return it once
/// complete. Never panics on client-side errors; those are logged and
/// attached to the affected channels.
pub async fn run(mut ctx: DispatchContext, deps: PipelineDeps<'_>) -> DispatchContext {
    for channel in &mut ctx.channels {
        channel.status = ChannelStatus::Dispatching;
    }

    if let Some(outcome) = run_internal_filters(&mut ctx, deps.internal_filters).await {
        abort(&mut ctx, outcome);
        ctx.locks.release();
        ctx.phase = Phase::Done;
        return ctx;
    }

    ctx.phase = Phase::Observers;
    run_observers(&mut ctx, deps.registry, deps.bus).await;

    ctx.skip_approval = ctx.requested_only()
        || ctx
            .possible_handlers
            .first()
            .map(|h| h.bypass_approval)
            .unwrap_or(false);

    if !ctx.skip_approval && !ctx.is_cancelled() {
        ctx.phase = Phase::Approvers;
        run_approvers(&mut ctx, deps.registry, deps.bus, deps.notifications, deps.live_operations).await;
    }

    let ready = ctx.locks.release();
    debug_assert!(ready, "structural lock must reach zero once observers and approvers have replied");

    if ctx.is_cancelled() {
        debug!(account = %ctx.account, "context cancelled; skipping handler phase");
        for channel in &mut ctx.channels {
            if !channel.is_terminal() {
                channel.mark_failed(DispatchError::Cancelled);
            }
        }
    } else {
        ctx.phase = Phase::Handlers;
        run_handlers(&mut ctx, deps.bus).await;
    }

    ctx.phase = Phase::Done;
    ctx
}

async fn run_internal_filters(ctx: &mut DispatchContext, filters: &[Box<dyn InternalFilter>]) -> Option<InternalOutcome> {
    for filter in filters {
        match filter.check(ctx).await {
            InternalOutcome::Continue => continue,
            InternalOutcome::Unavailable(path) => {
                warn!(filter = filter.name(), %path, "internal filter marked channel unavailable");
                if let Some(channel) = ctx.channels.iter_mut().find(|c| c.path == path) {
                    channel.mark_failed(DispatchError::NotAvailable);
                }
            }
            other => {
                warn!(filter = filter.name(), outcome = ?other, "internal filter aborted the batch");
                return Some(other);
            }
        }
    }
    None
}

fn abort(ctx: &mut DispatchContext, outcome: InternalOutcome) {
    let error = match outcome {
        InternalOutcome::Cancel => {
            ctx.cancelled = true;
            crate::metrics::BATCHES_CANCELLED.inc();
            DispatchError::Cancelled
        }
        InternalOutcome::Reject(reason) => DispatchError::FilterRejected(reason),
        InternalOutcome::Continue => unreachable!(),
    };
    for channel in &mut ctx.channels {
        channel.mark_failed(error.clone());
    }
}

fn matches_any_channel(filters: &[crate::filter::Filter], ctx: &DispatchContext) -> bool {
    ctx.channels.iter().any(|c| best_score(filters, c) > 0)
}

async fn run_observers(ctx: &mut DispatchContext, registry: &ClientRegistry, bus: &Arc<dyn BusConnection>) {
    let observers: Vec<Client> = registry
        .active_with(CapabilityKind::Observer)
        .into_iter()
        .filter(|c| matches_any_channel(c.filters_for(CapabilityKind::Observer), ctx))
        .collect();

    if observers.is_empty() {
        return;
    }

    let paths: Vec<ChannelPath> = ctx.channels.iter().map(|c| c.path.clone()).collect();
    for _ in &observers {
        ctx.locks.take();
    }

    let calls = observers.iter().map(|client| {
        let bus = Arc::clone(bus);
        let name = client.bus_name.clone();
        let paths = paths.clone();
        async move { (name.clone(), bus.observe_channels(&name, &paths).await) }
    });
    let results = join_all(calls).await;

    for (name, result) in results {
        if let Err(e) = result {
            warn!(client = %name, error = %e, "observer call failed; dispatch continues");
        }
        ctx.locks.release();
    }
}

async fn run_approvers(
    ctx: &mut DispatchContext,
    registry: &ClientRegistry,
    bus: &Arc<dyn BusConnection>,
    notifications: &NotificationHub,
    live_operations: &DashMap<String, LiveOperation>,
) {
    let approvers: Vec<Client> = registry
        .active_with(CapabilityKind::Approver)
        .into_iter()
        .filter(|c| matches_any_channel(c.filters_for(CapabilityKind::Approver), ctx))
        .collect();

    if approvers.is_empty() {
        debug!(account = %ctx.account, "no matching approver; proceeding as if approval were bypassed");
        return;
    }

    ctx.locks.take(); // approver phase as a whole

    let paths: Vec<ChannelPath> = ctx.channels.iter().map(|c| c.path.clone()).collect();
    let handler_names: Vec<String> = ctx.possible_handlers.iter().map(|h| h.bus_name.clone()).collect();
    let operation = Arc::new(Mutex::new(DispatchOperation::new(paths, handler_names)));
    let op_path = operation.lock().path.clone();
    let properties = operation_properties(&operation.lock());

    live_operations.insert(op_path.clone(), LiveOperation { properties: properties.clone() });
    crate::metrics::DISPATCH_OPERATIONS_CREATED.inc();
    notifications
        .emit(Notification::NewDispatchOperation {
            path: op_path.clone(),
            properties: properties.clone(),
        })
        .await;

    ctx.approvers_invoked = approvers.len() as u32;
    for _ in &approvers {
        operation.lock().block_finish();
    }

    let calls = approvers.iter().map(|client| {
        let bus = Arc::clone(bus);
        let name = client.bus_name.clone();
        let path = op_path.clone();
        let props = properties.clone();
        let operation = Arc::clone(&operation);
        async move {
            let reply = bus.add_dispatch_operation(&name, &path, &props).await;
            let decision_error = match &reply {
                Ok(ApproverDecision::Claim) => operation.lock().claim().err(),
                Ok(ApproverDecision::HandleWith(handler)) => operation.lock().handle_with(handler.clone()).err(),
                Err(_) => None,
            };
            if let Some(e) = decision_error {
                warn!(client = %name, error = %e, "approver decision rejected by dispatch operation");
            }
            operation.lock().unblock_finish();
            (name, reply)
        }
    });

    let mut approvers_failed = 0u32;
    for (name, reply) in join_all(calls).await {
        if let Err(e) = reply {
            approvers_failed += 1;
            warn!(client = %name, error = %e, "approver failed to accept dispatch operation");
        }
    }
    ctx.approvers_failed = approvers_failed;

    if !operation.lock().is_finished() {
        warn!(
            operation = %op_path,
            invoked = ctx.approvers_invoked,
            failed = ctx.approvers_failed,
            "no approver reached a decision; proceeding as if none existed"
        );
        let _ = operation.lock().handle_with(None);
    }

    match operation.lock().state().clone() {
        OperationState::Claimed => {
            for channel in &mut ctx.channels {
                channel.mark_dispatched(None);
            }
        }
        OperationState::HandleWith(handler) => {
            ctx.selected_handler_override = handler;
        }
        OperationState::Pending => unreachable!("operation is forced to a decision above"),
    }

    live_operations.remove(&op_path);
    notifications.emit(Notification::DispatchOperationFinished { path: op_path }).await;
    ctx.locks.release();
}

/// Every candidate in `ctx.possible_handlers` already qualifies for
/// every channel in the batch (§4.2's batch disqualification rule), so
/// the chosen handler is always invoked with the whole pending set;
/// there is no per-channel partial acceptance to split off. The
/// "leftover" loop from §4.3 point 4 is therefore a fallback across
/// *candidates*, not a re-partition of channels: if the top-ranked
/// handler's `handle_channels` call fails, the next-ranked candidate is
/// tried against the same pending set, and so on, until one succeeds or
/// the ranked list is exhausted (fatal: `NoProgress`).
///
/// An approver's explicit `HandleWith` binds the batch to that one
/// handler; per spec.md §7 a failure there is a known limitation and is
/// not retried against another candidate.
async fn run_handlers(ctx: &mut DispatchContext, bus: &Arc<dyn BusConnection>) {
    let pending: Vec<usize> = ctx
        .channels
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_terminal())
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return;
    }
    let paths: Vec<ChannelPath> = pending.iter().map(|&i| ctx.channels[i].path.clone()).collect();

    if let Some(handler_name) = ctx.selected_handler_override.clone() {
        invoke_chosen_handler(ctx, bus, &handler_name, &pending, &paths).await;
        return;
    }

    if ctx.possible_handlers.is_empty() {
        for &i in &pending {
            ctx.channels[i].mark_failed(DispatchError::NoHandler);
        }
        return;
    }

    for &i in &pending {
        ctx.channels[i].status = ChannelStatus::HandlerInvoked;
    }

    let candidates: Vec<String> = ctx.possible_handlers.iter().map(|h| h.bus_name.clone()).collect();
    for handler_name in &candidates {
        match bus.handle_channels(handler_name, &paths).await {
            Ok(()) => {
                for &i in &pending {
                    ctx.channels[i].mark_dispatched(Some(handler_name.clone()));
                }
                return;
            }
            Err(e) => {
                warn!(handler = %handler_name, error = %e, "handler failed to accept channels; trying next candidate");
            }
        }
    }

    warn!(account = %ctx.account, candidates = candidates.len(), "every candidate handler failed; leftover channels made no progress");
    for &i in &pending {
        ctx.channels[i].mark_failed(DispatchError::NoProgress);
    }
}

async fn invoke_chosen_handler(
    ctx: &mut DispatchContext,
    bus: &Arc<dyn BusConnection>,
    handler_name: &str,
    pending: &[usize],
    paths: &[ChannelPath],
) {
    for &i in pending {
        ctx.channels[i].status = ChannelStatus::HandlerInvoked;
    }
    match bus.handle_channels(handler_name, paths).await {
        Ok(()) => {
            for &i in pending {
                ctx.channels[i].mark_dispatched(Some(handler_name.to_string()));
            }
        }
        Err(e) => {
            for &i in pending {
                ctx.channels[i].mark_failed(DispatchError::HandlerFailed {
                    handler: handler_name.to_string(),
                    reason: e.to_string(),
                });
            }
            warn!(
                handler = %handler_name,
                error = %e,
                "handler failed to accept channels; not retried against another handler (known limitation)"
            );
        }
    }
}
