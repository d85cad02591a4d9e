//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transfer initiation and outcomes
//! - Callback routing (waiter, fallback, unmatched)
//! - Rendezvous registry size and reaper evictions
//! - Status store write failures

use crate::error::{TransferError, TransferResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref TRANSFERS_INITIATED: CounterVec = register_counter_vec!(
        "transfer_coordinator_transfers_initiated_total",
        "Total transfers written as pending",
        &[]
    ).unwrap();

    pub static ref TRANSFER_OUTCOMES: CounterVec = register_counter_vec!(
        "transfer_coordinator_transfer_outcomes_total",
        "Transfer status transitions by resulting state",
        &["status"]
    ).unwrap();

    pub static ref CALLBACKS_RECEIVED: CounterVec = register_counter_vec!(
        "transfer_coordinator_callbacks_total",
        "Block callbacks by how they were matched",
        &["route"]
    ).unwrap();

    pub static ref TERMINAL_NOOPS: CounterVec = register_counter_vec!(
        "transfer_coordinator_terminal_noops_total",
        "Updates ignored because the transfer was already terminal",
        &[]
    ).unwrap();

    pub static ref STORE_WRITE_FAILURES: CounterVec = register_counter_vec!(
        "transfer_coordinator_store_write_failures_total",
        "Status store writes that failed during callback or timeout handling",
        &["operation"]
    ).unwrap();

    pub static ref PENDING_RENDEZVOUS: Gauge = register_gauge!(
        "transfer_coordinator_pending_rendezvous",
        "Callers currently waiting for a block callback"
    ).unwrap();

    pub static ref REAPED_ENTRIES: CounterVec = register_counter_vec!(
        "transfer_coordinator_reaped_entries_total",
        "Rendezvous entries closed by the stale-entry reaper",
        &[]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: Histogram = register_histogram!(
        "transfer_coordinator_confirmation_latency_seconds",
        "Time from rendezvous registration to callback delivery",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "transfer_coordinator_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "transfer_coordinator_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TransferResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TransferError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TransferError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn render() -> TransferResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TransferError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TransferError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_transfer_initiated() {
    TRANSFERS_INITIATED.with_label_values(&[]).inc();
}

pub fn record_transfer_outcome(status: &str) {
    TRANSFER_OUTCOMES.with_label_values(&[status]).inc();
}

pub fn record_callback(route: &str) {
    CALLBACKS_RECEIVED.with_label_values(&[route]).inc();
}

pub fn record_terminal_noop() {
    TERMINAL_NOOPS.with_label_values(&[]).inc();
}

pub fn record_store_write_failure(operation: &str) {
    STORE_WRITE_FAILURES.with_label_values(&[operation]).inc();
}

pub fn set_pending_rendezvous(count: usize) {
    PENDING_RENDEZVOUS.set(count as f64);
}

pub fn record_reaped(count: usize) {
    REAPED_ENTRIES.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_confirmation_latency(latency_secs: f64) {
    CONFIRMATION_LATENCY.observe(latency_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
