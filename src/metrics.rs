// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!("prices_recorded_total", "Price records written, by kind (direct/routed).");
    describe_counter!("swaps_without_route_total", "Indirect swaps skipped because neither leg had a usable route.");
    describe_counter!("router_rebuilds_total", "Route graph rebuilds.");
    describe_gauge!("router_routes", "Routes held by the current route graph snapshot.");
    describe_gauge!("task_processed_height", "Last processed height per scheduled task.");
    describe_counter!("height_gate_waits_total", "Polls spent waiting on a parent task's height.");
    describe_counter!("task_errors_total", "Task executions that returned an error.");
    describe_histogram!("router_rebuild_seconds", "Route discovery duration.");
    describe_histogram!("price_height_seconds", "Time spent pricing one height.");
}

/// Installs the Prometheus exporter on `0.0.0.0:{port}`.
#[cfg(feature = "observability")]
pub fn init_prometheus_exporter(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn increment_prices_recorded(kind: &'static str, count: u64) {
    counter!("prices_recorded_total", count, "kind" => kind);
}

pub fn increment_swaps_without_route() {
    counter!("swaps_without_route_total", 1);
}

pub fn record_router_rebuild(duration: Duration, routes: usize) {
    counter!("router_rebuilds_total", 1);
    gauge!("router_routes", routes as f64);
    histogram!("router_rebuild_seconds", duration.as_secs_f64());
}

pub fn set_task_processed_height(task: &str, height: u64) {
    gauge!("task_processed_height", height as f64, "task" => task.to_string());
}

pub fn increment_height_gate_waits(task: &str) {
    counter!("height_gate_waits_total", 1, "task" => task.to_string());
}

pub fn increment_task_errors(task: &str) {
    counter!("task_errors_total", 1, "task" => task.to_string());
}

pub fn record_price_height_duration(duration: Duration) {
    histogram!("price_height_seconds", duration.as_secs_f64());
}
