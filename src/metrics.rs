//! Prometheus metrics for the channel dispatcher.
//!
//! Tracks pipeline throughput and outcomes: how many batches were
//! dispatched, cancelled, or refused, and what recovery found at
//! startup. Populated when [`crate::config::MetricsConfig::enabled`]
//! is set; surfacing the registry externally is left to the embedding
//! process.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Channels that reached the `Dispatched` terminal state.
    pub static ref CHANNELS_DISPATCHED: IntCounter = IntCounter::new(
        "channel_dispatcher_channels_dispatched_total",
        "Channels that reached the Dispatched terminal state"
    ).unwrap();

    /// Channels that reached the `Failed` terminal state, by error variant.
    pub static ref CHANNELS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "channel_dispatcher_channels_failed_total",
            "Channels that reached the Failed terminal state"
        ),
        &["reason"],
    ).unwrap();

    /// Dispatch batches aborted mid-pipeline by an internal filter or cancellation.
    pub static ref BATCHES_CANCELLED: IntCounter = IntCounter::new(
        "channel_dispatcher_batches_cancelled_total",
        "Dispatch batches aborted mid-pipeline"
    ).unwrap();

    /// Dispatch operations created for approver review.
    pub static ref DISPATCH_OPERATIONS_CREATED: IntCounter = IntCounter::new(
        "channel_dispatcher_dispatch_operations_created_total",
        "Dispatch operations created"
    ).unwrap();

    /// Channels reconciled as already-owned during startup recovery.
    pub static ref RECOVERY_RECONCILED: IntCounter = IntCounter::new(
        "channel_dispatcher_recovery_reconciled_total",
        "Channels found already owned by a handler during startup recovery"
    ).unwrap();

    /// Clients currently known to the registry.
    pub static ref CLIENTS_KNOWN: IntGauge = IntGauge::new(
        "channel_dispatcher_clients_known",
        "Clients currently known to the registry"
    ).unwrap();
}

/// Register every metric with [`REGISTRY`]. Must be called once at
/// startup before any metric is recorded.
pub fn init() {
    REGISTRY.register(Box::new(CHANNELS_DISPATCHED.clone())).unwrap();
    REGISTRY.register(Box::new(CHANNELS_FAILED.clone())).unwrap();
    REGISTRY.register(Box::new(BATCHES_CANCELLED.clone())).unwrap();
    REGISTRY.register(Box::new(DISPATCH_OPERATIONS_CREATED.clone())).unwrap();
    REGISTRY.register(Box::new(RECOVERY_RECONCILED.clone())).unwrap();
    REGISTRY.register(Box::new(CLIENTS_KNOWN.clone())).unwrap();
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
