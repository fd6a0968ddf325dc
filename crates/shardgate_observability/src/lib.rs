//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// One finished merge session.
pub fn record_merge_session(outcome: &str, rows_emitted: u64, rows_forwarded: u64) {
    metrics::counter!("shardgate_merge_sessions_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("shardgate_merge_rows_emitted").record(rows_emitted as f64);
    metrics::counter!("shardgate_merge_rows_forwarded_total").increment(rows_forwarded);
}

/// A producer found its source queue full and had to block.
pub fn record_merge_backpressure() {
    metrics::counter!("shardgate_merge_backpressure_total").increment(1);
}

pub fn record_xa_stage(stage: &str) {
    metrics::counter!("shardgate_xa_stage_entered_total", "stage" => stage.to_string()).increment(1);
}

pub fn record_xa_outcome(outcome: &str) {
    metrics::counter!("shardgate_xa_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_txn_log_write(kind: &str, success: bool, duration_us: u64) {
    metrics::counter!("shardgate_txn_log_writes_total", "kind" => kind.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("shardgate_txn_log_write_us", "kind" => kind.to_string()).record(duration_us as f64);
}

pub fn record_recovery_sweep(resolved: u64, pending: usize) {
    metrics::counter!("shardgate_recovery_resolved_total").increment(resolved);
    metrics::gauge!("shardgate_recovery_pending").set(pending as f64);
}

/// Non-terminal records found in the transaction log by an inspection pass.
pub fn record_unfinished_transactions(count: usize) {
    metrics::gauge!("shardgate_txn_log_unfinished").set(count as f64);
}
