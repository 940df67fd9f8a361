// src/core/metrics.rs

//! Defines and registers Prometheus metrics for daemon monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of client connections currently open, in the dispatcher or in a locker.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("flomd_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of lockers currently alive.
    pub static ref ACTIVE_LOCKERS: Gauge =
        register_gauge!("flomd_active_lockers", "Number of live resource lockers.").unwrap();
    /// Connections parked in the incubator, waiting for a resource to be created.
    pub static ref INCUBATING_CLIENTS: Gauge =
        register_gauge!("flomd_incubating_clients", "Number of connections waiting for a resource to exist.").unwrap();

    // --- Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("flomd_connections_received_total", "Total number of connections received.").unwrap();
    pub static ref LOCKERS_STARTED_TOTAL: Counter =
        register_counter!("flomd_lockers_started_total", "Total number of lockers started.").unwrap();
    pub static ref LOCKERS_REAPED_TOTAL: Counter =
        register_counter!("flomd_lockers_reaped_total", "Total number of idle lockers reaped.").unwrap();
    /// Connections handed from the dispatcher to a locker.
    pub static ref TRANSFERS_TOTAL: Counter =
        register_counter!("flomd_transfers_total", "Total number of connection transfers to lockers.").unwrap();
    /// Replies sent to lock requests, labeled by reply code.
    pub static ref LOCK_OUTCOMES_TOTAL: CounterVec =
        register_counter_vec!("flomd_lock_outcomes_total", "Lock request outcomes, labeled by reply code.", &["rc"]).unwrap();

    // --- Histograms ---
    /// Time a lock is held, from grant to release.
    pub static ref LOCK_HOLD_SECONDS: Histogram =
        register_histogram!("flomd_lock_hold_seconds", "Time between a lock grant and its release in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
