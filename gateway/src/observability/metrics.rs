//! Gateway metrics, Prometheus-flavored.
//!
//! Naming follows the usual conventions: `gateway_` prefix, `_total` for
//! counters, `_seconds` for duration histograms. Endpoint labels are
//! normalized so a path like `/api/v2/<jobId>` doesn't explode cardinality
//! with one series per ticket.

use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder and return its handle for
/// serving `/metrics`. Must run before any `record_*` call.
pub fn init_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("gateway_http_request".to_string()),
            &[0.005, 0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.000, 2.000],
        )
        .map_err(|e| format!("failed to set http request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("gateway_query".to_string()),
            &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000],
        )
        .map_err(|e| format!("failed to set query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(path);
    let status = categorize_status_code(status_code);

    histogram!("gateway_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint.clone(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("gateway_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

pub fn record_query(operation: &str, status: &str, duration: Duration) {
    histogram!("gateway_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("gateway_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_job_created() {
    counter!("gateway_jobs_created_total").increment(1);
}

pub fn record_job_drained(found: bool) {
    counter!("gateway_jobs_drained_total",
        "found" => found.to_string()
    )
    .increment(1);
}

pub fn record_ws_connection_opened() {
    counter!("gateway_ws_connections_opened_total").increment(1);
}

pub fn record_ws_connection_closed() {
    counter!("gateway_ws_connections_closed_total").increment(1);
}

pub fn record_signature_verification(status: &str) {
    counter!("gateway_signature_verifications_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_provider_reload(loaded: usize) {
    counter!("gateway_provider_reloads_total").increment(1);
    histogram!("gateway_provider_reload_count").record(loaded as f64);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

fn normalize_endpoint(path: &str) -> String {
    match path {
        "/api/ping" | "/api/time" | "/metrics" => path.to_string(),
        _ if path.starts_with("/api/v2/") => "/api/v2/{jobId}".to_string(),
        _ if path.starts_with("/api/v1/") || path.starts_with("/api/v2/") => {
            normalize_versioned_path(path)
        }
        _ if path.starts_with("/session/") => "/session/{identity}".to_string(),
        _ if path.starts_with("/oauth2/") => "/oauth2/{provider}".to_string(),
        _ => "/other".to_string(),
    }
}

fn normalize_versioned_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", "api", version, "sign", action] => format!("/api/{version}/sign/{action}"),
        ["", "api", version, ..] => format!("/api/{version}/{{path}}"),
        _ => "/other".to_string(),
    }
}
