//! Recovery Subsystem: §4.5.
//!
//! On startup, reconciles whatever channels are already alive in the
//! system (supplied by the connection-manager collaborators, out of
//! this crate's scope) against the cached `HandledChannels` of every
//! active handler, so already-claimed channels aren't redundantly
//! re-dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::bus::BusConnection;
use crate::channel::{Channel, ChannelPath};
use crate::dispatch::lock::ClientLockCounter;
use crate::registry::ClientRegistry;

/// Result of one recovery pass: channels confirmed owned by a handler,
/// and channels nobody claims, ready to re-enter `take_channels`.
pub struct Reconciled {
    pub dispatched: Vec<Channel>,
    pub undispatched: Vec<Channel>,
}

/// Takes the structural lock (1 + one per active handler queried)
/// described in §4.5, though with `join_all` driving the queries
/// concurrently the counter's transitions collapse to bookkeeping
/// rather than a real suspension point.
pub async fn reconcile(registry: &ClientRegistry, bus: &Arc<dyn BusConnection>, alive: Vec<Channel>) -> Reconciled {
    let handlers = registry.active_handlers();
    let locks = ClientLockCounter::new();
    for _ in &handlers {
        locks.take();
    }

    let queries = handlers.iter().map(|h| {
        let bus = Arc::clone(bus);
        let name = h.bus_name.clone();
        async move { (name.clone(), bus.handled_channels(&name).await) }
    });
    let results = join_all(queries).await;

    let mut owned: HashMap<ChannelPath, String> = HashMap::new();
    for (name, result) in results {
        match result {
            Ok(paths) => {
                for path in paths {
                    owned.insert(path, name.clone());
                }
            }
            Err(e) => warn!(handler = %name, error = %e, "failed to fetch handled channels during recovery"),
        }
        locks.release();
    }
    let structural_release_reached_zero = locks.release();
    debug_assert!(structural_release_reached_zero, "recovery lock counter must reach zero once every query returns");

    let mut dispatched = Vec::new();
    let mut undispatched = Vec::new();
    for mut channel in alive {
        if let Some(handler) = owned.get(&channel.path) {
            channel.mark_dispatched(Some(handler.clone()));
            dispatched.push(channel);
        } else {
            undispatched.push(channel);
        }
    }

    crate::metrics::RECOVERY_RECONCILED.inc_by(dispatched.len() as u64);
    info!(
        dispatched = dispatched.len(),
        undispatched = undispatched.len(),
        "startup recovery reconciled channels against active handlers"
    );
    Reconciled { dispatched, undispatched }
}
