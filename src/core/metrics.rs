// src/core/metrics.rs

//! Defines and registers Prometheus metrics for fabric monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered
//! only once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, TextEncoder, register_counter, register_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// The number of transport sessions currently connected.
    pub static ref CONNECTED_SESSIONS: Gauge =
        register_gauge!("ahad_connected_sessions", "Number of currently connected transport sessions.").unwrap();
    /// The number of service records currently online.
    pub static ref SERVICES_ONLINE: Gauge =
        register_gauge!("ahad_services_online", "Number of registry records currently online.").unwrap();
    /// The last committed nexus offset.
    pub static ref NEXUS_INDX: Gauge =
        register_gauge!("ahad_nexus_indx", "Count of committed nexus log entries.").unwrap();

    // --- Counters ---
    /// Total RPC calls dispatched since startup.
    pub static ref CALLS_PROCESSED_TOTAL: Counter =
        register_counter!("ahad_calls_processed_total", "Total number of RPC calls processed.").unwrap();
    /// Total transport sessions accepted since startup.
    pub static ref SESSIONS_RECEIVED_TOTAL: Counter =
        register_counter!("ahad_sessions_received_total", "Total number of transport sessions received.").unwrap();
    /// Total one-time provisioning tokens redeemed.
    pub static ref PROV_TOKENS_CONSUMED_TOTAL: Counter =
        register_counter!("ahad_prov_tokens_consumed_total", "Total number of provisioning tokens consumed.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
