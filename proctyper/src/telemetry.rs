//! OpenTelemetry metrics export module
//!
//! Exports classification and tracking metrics collected by proctyper to an
//! OpenTelemetry Collector.
//!
//! ## OTLP Endpoint
//! Metrics are exported only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use proctyper_common::RuntimeKind;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<TyperMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Values read by the observable gauge callbacks
static INSPECTIONS_IN_FLIGHT: AtomicU64 = AtomicU64::new(0);
static TRACKED_OWNERS: AtomicU64 = AtomicU64::new(0);

/// proctyper metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct TyperMetrics {
    pub classifications: Counter<u64>,
    pub cache_hits: Counter<u64>,
    pub cache_misses: Counter<u64>,
    pub cache_evictions: Counter<u64>,
    pub inspection_failures: Counter<u64>,
    pub inspection_latency_ns: Histogram<u64>,
    pub tracked_attribute_rejections: Counter<u64>,
}

impl TyperMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            classifications: meter
                .u64_counter("classifications")
                .with_description("Number of executables inspected, by detected runtime")
                .with_unit("executables")
                .build(),
            cache_hits: meter
                .u64_counter("classification_cache_hits")
                .with_description("Classification requests served from the cache")
                .with_unit("requests")
                .build(),
            cache_misses: meter
                .u64_counter("classification_cache_misses")
                .with_description("Classification requests that missed the cache")
                .with_unit("requests")
                .build(),
            cache_evictions: meter
                .u64_counter("classification_cache_evictions")
                .with_description("Cached classifications evicted to make room")
                .with_unit("entries")
                .build(),
            inspection_failures: meter
                .u64_counter("inspection_failures")
                .with_description("Executables that could not be classified")
                .with_unit("executables")
                .build(),
            inspection_latency_ns: meter
                .u64_histogram("inspection_latency_ns")
                .with_description("Time spent inspecting one executable")
                .with_unit("ns")
                .build(),
            tracked_attribute_rejections: meter
                .u64_counter("tracked_attribute_rejections")
                .with_description("Observed values dropped because the owner's set was full")
                .with_unit("values")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "proctyper"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    // Meter name is used as prefix only
    let meter = global::meter("proctyper");

    let _in_flight_gauge = meter
        .u64_observable_gauge("inspections_in_flight")
        .with_description("Executable inspections currently running")
        .with_unit("inspections")
        .with_callback(|observer| {
            observer.observe(INSPECTIONS_IN_FLIGHT.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _owners_gauge = meter
        .u64_observable_gauge("tracked_owners")
        .with_description("Processes with a tracked attribute set")
        .with_unit("processes")
        .with_callback(|observer| {
            observer.observe(TRACKED_OWNERS.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(TyperMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TyperMetrics> {
    METRICS.get()
}

pub fn record_cache_lookup(hit: bool) {
    if let Some(m) = metrics() {
        if hit {
            m.cache_hits.add(1, &[]);
        } else {
            m.cache_misses.add(1, &[]);
        }
    }
}

pub fn record_cache_eviction() {
    if let Some(m) = metrics() {
        m.cache_evictions.add(1, &[]);
    }
}

pub fn record_classification(kind: RuntimeKind) {
    if let Some(m) = metrics() {
        let attrs = [KeyValue::new("runtime", kind.as_str())];
        m.classifications.add(1, &attrs);
    }
}

pub fn record_inspection(elapsed: Duration) {
    if let Some(m) = metrics() {
        m.inspection_latency_ns
            .record(elapsed.as_nanos() as u64, &[]);
    }
}

pub fn record_inspection_failure() {
    if let Some(m) = metrics() {
        m.inspection_failures.add(1, &[]);
    }
}

pub fn record_tracker_rejection() {
    if let Some(m) = metrics() {
        m.tracked_attribute_rejections.add(1, &[]);
    }
}

/// Updates the values reported by the observable gauges
pub fn record_gauges(inspections_in_flight: usize, tracked_owners: usize) {
    INSPECTIONS_IN_FLIGHT.store(inspections_in_flight as u64, Ordering::Relaxed);
    TRACKED_OWNERS.store(tracked_owners as u64, Ordering::Relaxed);
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint().is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "") };
        assert!(get_otlp_endpoint().is_none());
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_adds_http_prefix() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317") };

        let endpoint = get_otlp_endpoint();
        assert_eq!(endpoint, Some("http://collector:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_cache_lookup(true);
        record_classification(RuntimeKind::Go);
        record_inspection(Duration::from_millis(3));
        record_gauges(2, 5);
        assert_eq!(INSPECTIONS_IN_FLIGHT.load(Ordering::Relaxed), 2);
    }
}
