//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter, registers
//! human-readable descriptions for each metric and serves the scrape endpoint.

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works:
/// the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving `GET /metrics` in the Prometheus text format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

fn describe() {
    // -- Proxy (RED) --
    describe_counter!("llmgate_requests_total", "Total proxied requests by method and status");
    describe_histogram!(
        "llmgate_request_duration_seconds",
        "End-to-end request duration, including the streamed body"
    );
    describe_counter!(
        "llmgate_upstream_retries_total",
        "Upstream attempts retried after a connection failure or not-ready status"
    );

    // -- Lifecycle --
    describe_counter!("llmgate_setup_total", "Setup passes by result");
    describe_histogram!(
        "llmgate_setup_duration_seconds",
        "Duration of setup passes (access, rotation, start, readiness)"
    );
    describe_counter!("llmgate_rotations_total", "Boot credential rotations");
    describe_gauge!("llmgate_gate_open", "1 while the readiness gate is open");

    // -- Tokens --
    describe_counter!("llmgate_tokens_input_total", "Input tokens across all requests");
    describe_counter!("llmgate_tokens_output_total", "Output tokens across all requests");

    // -- Hooks --
    describe_histogram!("llmgate_hook_duration_seconds", "Hook script execution time");
    describe_counter!("llmgate_hook_failures_total", "Total hook script failures");
}
