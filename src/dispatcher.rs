//! Root wiring: §2, §4.4 (external surface), §4.6.
//!
//! [`Dispatcher`] owns the [`ClientRegistry`], the [`BusConnection`],
//! the internal filter chain, and the notification hub that gates
//! `new-dispatch-operation` / `dispatch-operation-finished` traffic
//! until the first reader asks for `DispatchOperations`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::bus::BusConnection;
use crate::channel::{Channel, ChannelPath};
use crate::dispatch::pipeline::{self, InternalFilter, PipelineDeps};
use crate::dispatch::DispatchContext;
use crate::error::{DispatchError, RegistryError};
use crate::filter::rank_handlers;
use crate::operation::DispatchOperation;
use crate::recovery;
use crate::registry::ClientRegistry;
use crate::value::PropertyMap;

/// Everything observable from outside one dispatch: operation
/// lifecycle and per-channel failure, mirroring the donor's
/// `broadcast`-based peer fan-out in `sync/manager.rs`.
#[derive(Debug, Clone)]
pub enum Notification {
    NewDispatchOperation { path: String, properties: PropertyMap },
    DispatchOperationFinished { path: String },
    DispatchCompleted { account: String },
    DispatchFailed { channel: ChannelPath, error: DispatchError },
}

/// Gates notification traffic until `DispatchOperations` has been read
/// at least once (§5: "suppressed until the first external reader
/// queries ... this is load-bearing").
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
    active: AtomicBool,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            active: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Called by the `DispatchOperations` property getter; flips the
    /// gate open permanently.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub async fn emit(&self, notification: Notification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        // No receivers is not an error: nothing is listening yet even
        // though the gate is open.
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live, unfinished Dispatch Operation, keyed by path, exposed
/// through the `DispatchOperations` bus property.
pub(crate) struct LiveOperation {
    pub properties: PropertyMap,
}

/// Root object: wires the registry, the bus, the pipeline, and
/// recovery together, and exposes the bus-facing `DispatchOperations`
/// surface and request entry points.
pub struct Dispatcher {
    pub registry: ClientRegistry,
    bus: Arc<dyn BusConnection>,
    internal_filters: Vec<Box<dyn InternalFilter>>,
    notifications: NotificationHub,
    pub(crate) live_operations: DashMap<String, LiveOperation>,
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
    dispatched_channels: Mutex<HashMap<String, Channel>>,
}

impl Dispatcher {
    pub fn new(registry: ClientRegistry, bus: Arc<dyn BusConnection>, internal_filters: Vec<Box<dyn InternalFilter>>) -> Self {
        Self {
            registry,
            bus,
            internal_filters,
            notifications: NotificationHub::new(),
            live_operations: DashMap::new(),
            cancel_flags: DashMap::new(),
            dispatched_channels: Mutex::new(HashMap::new()),
        }
    }

    /// Boot sequence: registry discovery, then reconciliation of
    /// `alive_channels` (supplied by the connection-manager layer,
    /// outside this crate's scope) against active handlers' cached
    /// `HandledChannels`.
    pub async fn bootstrap(&self, alive_channels: Vec<Channel>) -> Result<(), RegistryError> {
        self.registry.bootstrap().await?;
        let reconciled = recovery::reconcile(&self.registry, &self.bus, alive_channels).await;
        for channel in reconciled.dispatched {
            self.dispatched_channels.lock().insert(channel.path.0.clone(), channel);
        }
        for channel in reconciled.undispatched {
            let account = channel
                .property("account")
                .map(|v| format!("{v:?}"))
                .unwrap_or_default();
            info!(channel = %channel.path, "recovered channel unowned by any handler; re-submitting");
            self.take_channels(account, vec![channel]).await;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Bus handle, for collaborators (the request entry point's
    /// `add_request`/`remove_request` delivery) that need it directly
    /// rather than through a `Dispatcher` method.
    pub fn bus(&self) -> &Arc<dyn BusConnection> {
        &self.bus
    }

    /// Look up a channel this dispatcher has already dispatched, for
    /// introspection (e.g. the re-invocation path deciding whether to
    /// bypass the pipeline).
    pub fn dispatched_channel(&self, path: &ChannelPath) -> Option<Channel> {
        self.dispatched_channels.lock().get(&path.0).cloned()
    }

    /// `DispatchOperations` property getter. Reading it activates
    /// notification delivery (§5) as a side effect.
    pub fn dispatch_operations(&self) -> Vec<(String, PropertyMap)> {
        self.notifications.activate();
        self.live_operations
            .iter()
            .map(|e| (e.key().clone(), e.value().properties.clone()))
            .collect()
    }

    /// Request a cancellation for an in-flight context holding
    /// `channel`, if one exists. Mirrors "the owning client aborting a
    /// requested channel with the cancellation error" (§4.3).
    pub fn cancel(&self, channel: &ChannelPath) {
        if let Some(flag) = self.cancel_flags.get(&channel.0) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Entry point for a batch of channels (§4.3's `take_channels`).
    /// Splits the batch by candidate handler set so that channels with
    /// no possible handler are refused individually rather than
    /// failing the whole call.
    pub async fn take_channels(&self, account: impl Into<String>, channels: Vec<Channel>) {
        if channels.is_empty() {
            return;
        }
        let account = account.into();

        let handlers = self.registry.active_handlers();
        let ranked = rank_handlers(&handlers, &channels);
        if ranked.is_empty() {
            for mut channel in channels {
                channel.mark_failed(DispatchError::NoHandler);
                crate::metrics::CHANNELS_FAILED.with_label_values(&[DispatchError::NoHandler.label()]).inc();
                warn!(channel = %channel.path, "no handler matches channel; refused before context creation");
                self.notifications
                    .emit(Notification::DispatchFailed {
                        channel: channel.path.clone(),
                        error: DispatchError::NoHandler,
                    })
                    .await;
            }
            return;
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        for channel in &channels {
            self.cancel_flags.insert(channel.path.0.clone(), Arc::clone(&cancel_flag));
        }

        let mut ctx = DispatchContext::new(account.clone(), channels, ranked);
        ctx.cancel_flag = Arc::clone(&cancel_flag);

        let deps = PipelineDeps {
            registry: &self.registry,
            bus: &self.bus,
            internal_filters: &self.internal_filters,
            notifications: &self.notifications,
            live_operations: &self.live_operations,
        };
        let finished = pipeline::run(ctx, deps).await;

        for channel in &finished.channels {
            self.cancel_flags.remove(&channel.path.0);
            if channel.status == crate::channel::ChannelStatus::Dispatched {
                self.dispatched_channels.lock().insert(channel.path.0.clone(), channel.clone());
                crate::metrics::CHANNELS_DISPATCHED.inc();
            }
            if let Some(error) = &channel.error {
                crate::metrics::CHANNELS_FAILED.with_label_values(&[error.label()]).inc();
                self.notifications
                    .emit(Notification::DispatchFailed {
                        channel: channel.path.clone(),
                        error: error.clone(),
                    })
                    .await;
            }
        }
        self.notifications
            .emit(Notification::DispatchCompleted { account })
            .await;
    }

    /// Re-invocation (§4.3): a request targets a channel already
    /// Dispatched. Bypasses filters, observers, and approvers and
    /// delivers straight to the existing handler.
    pub async fn redeliver(&self, path: &ChannelPath, handler: &str) -> Result<(), DispatchError> {
        self.bus
            .handle_channels(handler, std::slice::from_ref(path))
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                handler: handler.to_string(),
                reason: e.to_string(),
            })
    }
}

pub(crate) fn operation_properties(operation: &DispatchOperation) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert(
        "Channels".to_string(),
        crate::value::Value::UInt(operation.channels.len() as u64),
    );
    props.insert(
        "PossibleHandlers".to_string(),
        crate::value::Value::UInt(operation.possible_handlers.len() as u64),
    );
    props
}
