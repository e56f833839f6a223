// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const METRICS_ROUTE: &str = "/metrics";

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.4, 0.5, 0.6, 0.8, 1.0, 1.5, 2.0, 2.5,
    3.0, 4.0, 5.0, 7.5, 10., 15., 20., 30., 45., 60., 90., 120.,
];

#[derive(Clone, Debug)]
pub struct CallerMetrics {
    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_queries_latency: HistogramVec,
    pub(crate) eth_rpc_errors: IntCounterVec,
    pub(crate) eth_node_connected: IntGauge,

    pub(crate) latest_observed_block: IntGauge,
    pub(crate) last_traversed_block: IntGauge,
    pub(crate) persisted_headers: IntCounter,
    pub(crate) persisted_events: IntCounter,
    pub(crate) persist_failures: IntCounter,
    pub(crate) sync_divergence_errors: IntCounter,

    pub(crate) tx_attempts: IntCounter,
    pub(crate) tx_send_errors: IntCounter,
    pub(crate) tx_nonce_too_low: IntCounter,
    pub(crate) tx_confirmed: IntCounter,
}

impl CallerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "caller_eth_rpc_queries",
                "Total number of queries issued to eth provider, by request type",
                &["type"],
                registry,
            )?,
            eth_rpc_queries_latency: register_histogram_vec_with_registry!(
                "caller_eth_rpc_queries_latency",
                "Latency of queries issued to eth provider, by request type",
                &["type"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            eth_rpc_errors: register_int_counter_vec_with_registry!(
                "caller_eth_rpc_errors",
                "Chain client errors, by error type",
                &["type"],
                registry,
            )?,
            eth_node_connected: register_int_gauge_with_registry!(
                "caller_eth_node_connected",
                "Whether the last request to the eth provider succeeded (1) or not (0)",
                registry,
            )?,
            latest_observed_block: register_int_gauge_with_registry!(
                "caller_latest_observed_block",
                "Head block number reported by the provider on the last traversal",
                registry,
            )?,
            last_traversed_block: register_int_gauge_with_registry!(
                "caller_last_traversed_block",
                "Number of the last header handed out by the header traversal",
                registry,
            )?,
            persisted_headers: register_int_counter_with_registry!(
                "caller_persisted_headers",
                "Total number of block headers committed to storage",
                registry,
            )?,
            persisted_events: register_int_counter_with_registry!(
                "caller_persisted_events",
                "Total number of contract events committed to storage",
                registry,
            )?,
            persist_failures: register_int_counter_with_registry!(
                "caller_persist_failures",
                "Batches whose storage transaction failed after all retries",
                registry,
            )?,
            sync_divergence_errors: register_int_counter_with_registry!(
                "caller_sync_divergence_errors",
                "Provider state divergences detected by the synchronizer",
                registry,
            )?,
            tx_attempts: register_int_counter_with_registry!(
                "caller_tx_attempts",
                "Priced transaction variants published by the transaction manager",
                registry,
            )?,
            tx_send_errors: register_int_counter_with_registry!(
                "caller_tx_send_errors",
                "Errors returned while publishing transaction variants",
                registry,
            )?,
            tx_nonce_too_low: register_int_counter_with_registry!(
                "caller_tx_nonce_too_low",
                "Publish attempts rejected with nonce too low",
                registry,
            )?,
            tx_confirmed: register_int_counter_with_registry!(
                "caller_tx_confirmed",
                "Transactions that reached the required number of confirmations",
                registry,
            )?,
        })
    }

    #[cfg(test)]
    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry).unwrap()
    }
}

/// Serve the registry in the prometheus text format at [`METRICS_ROUTE`].
pub fn start_prometheus_server(address: SocketAddr, registry: Registry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server on {}: {}", address, e);
                return;
            }
        };
        info!("Metrics server listening on {}", address);
        let router = Router::new()
            .route(METRICS_ROUTE, get(metrics_handler))
            .with_state(registry);
        if let Err(e) = axum::serve(listener, router.into_make_service()).await {
            error!("Metrics server stopped: {}", e);
        }
    })
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    match encode_metrics(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn encode_metrics(registry: &Registry) -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
