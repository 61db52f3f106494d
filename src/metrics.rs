// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics
//!
//! Observability counters for the relay server.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connections refused by the denylist.
    pub connections_denied: IntCounter,

    /// Handshakes that reached Authenticated.
    pub auth_success: IntCounter,
    /// Handshakes rejected (bad crypto, unknown id, wrong password, timeout).
    pub auth_failure: IntCounter,

    /// Position updates accepted and fanned out.
    pub updates_relayed: IntCounter,
    /// Inbound frames dropped (undecryptable or oversized).
    pub messages_dropped: IntCounter,
    /// Account create/delete operations handled, any outcome.
    pub account_operations: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connections_denied = IntCounter::with_opts(Opts::new(
            "relay_connections_denied_total",
            "Connections refused by the denylist",
        ))
        .unwrap();

        let auth_success = IntCounter::with_opts(Opts::new(
            "relay_auth_success_total",
            "Handshakes that reached Authenticated",
        ))
        .unwrap();

        let auth_failure = IntCounter::with_opts(Opts::new(
            "relay_auth_failure_total",
            "Handshakes rejected or timed out",
        ))
        .unwrap();

        let updates_relayed = IntCounter::with_opts(Opts::new(
            "relay_updates_relayed_total",
            "Position updates accepted and fanned out",
        ))
        .unwrap();

        let messages_dropped = IntCounter::with_opts(Opts::new(
            "relay_messages_dropped_total",
            "Inbound frames dropped (undecryptable or oversized)",
        ))
        .unwrap();

        let account_operations = IntCounter::with_opts(Opts::new(
            "relay_account_operations_total",
            "Account create/delete operations handled",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_denied.clone()))
            .unwrap();
        registry.register(Box::new(auth_success.clone())).unwrap();
        registry.register(Box::new(auth_failure.clone())).unwrap();
        registry
            .register(Box::new(updates_relayed.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(account_operations.clone()))
            .unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connections_denied,
            auth_success,
            auth_failure,
            updates_relayed,
            messages_dropped,
            account_operations,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
