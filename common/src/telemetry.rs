// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `log_level` applies. JSON output is
/// for log shippers, the human format for a terminal.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let registry = tracing_subscriber::registry();
    if json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter);
        registry
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        let text_layer = fmt::layer().with_target(true).with_filter(env_filter);
        registry
            .with(text_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(log_level, json, "structured logging initialized");
    Ok(())
}

/// Install the Prometheus exporter and describe every metric the scheduler
/// emits.
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("task_runs_total", "Task runs dispatched, by task");
    describe_counter!("task_failures_total", "Task runs that failed, by task");
    describe_counter!(
        "task_skips_total",
        "Due tasks skipped before dispatch, by task and reason"
    );
    describe_counter!(
        "store_errors_total",
        "Coordination store operations that failed"
    );
    describe_histogram!(
        "scheduler_tick_duration_seconds",
        "Wall time spent evaluating one tick"
    );

    tracing::info!(
        metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_task_run(task: &str) {
    counter!("task_runs_total", "task" => task.to_string()).increment(1);
}

#[inline]
pub fn record_task_failure(task: &str) {
    counter!("task_failures_total", "task" => task.to_string()).increment(1);
}

#[inline]
pub fn record_task_skip(task: &str, reason: &'static str) {
    counter!("task_skips_total", "task" => task.to_string(), "reason" => reason).increment(1);
}

#[inline]
pub fn record_store_error() {
    counter!("store_errors_total").increment(1);
}

#[inline]
pub fn record_tick_duration(duration: Duration) {
    histogram!("scheduler_tick_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_initializes_at_most_once() {
        let _ = init_logging("info", false);
        // A second subscriber in the same process must be rejected.
        assert!(init_logging("info", false).is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        // Without an installed recorder these are no-ops; they must not panic.
        record_task_run("test-task");
        record_task_failure("test-task");
        record_task_skip("test-task", "overlapping");
        record_store_error();
        record_tick_duration(Duration::from_millis(12));
    }
}
