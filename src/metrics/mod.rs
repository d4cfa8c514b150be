//! Prometheus metrics of the watch dispatcher, the caches and the
//! transaction coordinator.
//!
//! Metrics are created once and registered into [`REGISTRY`] the first time
//! [`gather_metrics`] is called; embedders with their own registry can call
//! [`register_custom_metrics`] instead.


use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    /// Store watches currently armed by all dispatchers
    pub static ref ARMED_WATCHES: IntGauge =
        IntGauge::new("coord_cache_armed_watches", "Store watches currently armed")
            .expect("metric can not be created");

    /// Events emitted to cache listeners, by cache type and event
    pub static ref CACHE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("coord_cache_events", "Events emitted by caches"),
        &["cache", "event"]
    )
    .expect("metric can not be created");

    /// Failed re-reads inside a cache worker, by cache type
    pub static ref RESYNC_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("coord_cache_resync_failures", "Failed cache refreshes"),
        &["cache"]
    )
    .expect("metric can not be created");

    /// Submitted transactions by outcome (committed, failed)
    pub static ref TRANSACTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("coord_cache_transactions", "Submitted transactions"),
        &["outcome"]
    )
    .expect("metric can not be created");

    /// Guaranteed deletes handed to the background retry, by outcome
    /// (scheduled, deleted, abandoned)
    pub static ref GUARANTEED_DELETES: IntCounterVec = IntCounterVec::new(
        Opts::new("coord_cache_guaranteed_deletes", "Guaranteed deletes retried in background"),
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

/// Registers every collector of this crate into `registry`
pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(ARMED_WATCHES.clone()))?;
    registry.register(Box::new(CACHE_EVENTS.clone()))?;
    registry.register(Box::new(RESYNC_FAILURES.clone()))?;
    registry.register(Box::new(TRANSACTIONS.clone()))?;
    registry.register(Box::new(GUARANTEED_DELETES.clone()))?;
    Ok(())
}

/// Text exposition of [`REGISTRY`]
pub fn gather_metrics() -> String {
    REGISTER.call_once(|| {
        if let Err(e) = register_custom_metrics(&REGISTRY) {
            warn!(?e, "could not register metrics");
        }
    });

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(?e, "could not encode metrics");
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            warn!(?e, "metrics could not be from_utf8'd");
            String::default()
        }
    }
}
