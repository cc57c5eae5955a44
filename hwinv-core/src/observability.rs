/*!
Logging and metrics for the inventory agent.

- Structured logging through `tracing`, plain or JSON
- Prometheus counters for cycles, failures and reported records (feature
  `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{InventoryError, Result};

/// Global metrics instance; `None` if the registry could not be built
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<InventoryMetrics>> = OnceLock::new();

/// Metrics collected by the poll loop
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct InventoryMetrics {
    /// Finished cycles by facet and outcome
    pub cycles_total: IntCounterVec,
    pub pull_failures_total: IntCounterVec,
    /// Failed uploads by facet and role (`parent` or `client`)
    pub upload_failures_total: IntCounterVec,
    pub records_reported_total: IntCounterVec,
    pub upload_latency_seconds: HistogramVec,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl InventoryMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounterVec::new(
            Opts::new("hwinv_cycles_total", "Inventory cycles finished"),
            &["facet", "outcome"],
        )
        .map_err(|e| metric_error("hwinv_cycles_total", e))?;

        let pull_failures_total = IntCounterVec::new(
            Opts::new("hwinv_pull_failures_total", "Environment queries that failed"),
            &["facet"],
        )
        .map_err(|e| metric_error("hwinv_pull_failures_total", e))?;

        let upload_failures_total = IntCounterVec::new(
            Opts::new("hwinv_upload_failures_total", "Uploads the sink rejected"),
            &["facet", "role"],
        )
        .map_err(|e| metric_error("hwinv_upload_failures_total", e))?;

        let records_reported_total = IntCounterVec::new(
            Opts::new("hwinv_records_reported_total", "Changed records sent to parent tables"),
            &["facet"],
        )
        .map_err(|e| metric_error("hwinv_records_reported_total", e))?;

        let upload_latency_seconds = HistogramVec::new(
            HistogramOpts::new("hwinv_upload_latency_seconds", "Duration of sink uploads in seconds"),
            &["table"],
        )
        .map_err(|e| metric_error("hwinv_upload_latency_seconds", e))?;

        for collector in [
            Box::new(cycles_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(pull_failures_total.clone()),
            Box::new(upload_failures_total.clone()),
            Box::new(records_reported_total.clone()),
            Box::new(upload_latency_seconds.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| metric_error("registry", e))?;
        }

        Ok(Self {
            cycles_total,
            pull_failures_total,
            upload_failures_total,
            records_reported_total,
            upload_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static InventoryMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_cycle(&self, facet: &str, outcome: &str) {
        self.cycles_total.with_label_values(&[facet, outcome]).inc();
    }

    pub fn record_pull_failure(&self, facet: &str) {
        self.pull_failures_total.with_label_values(&[facet]).inc();
    }

    pub fn record_upload_failure(&self, facet: &str, role: &str) {
        self.upload_failures_total.with_label_values(&[facet, role]).inc();
    }

    pub fn record_reported(&self, facet: &str, records: usize) {
        self.records_reported_total
            .with_label_values(&[facet])
            .inc_by(records as u64);
    }

    pub fn record_upload_latency(&self, table: &str, duration: Duration) {
        self.upload_latency_seconds
            .with_label_values(&[table])
            .observe(duration.as_secs_f64());
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metric_error("encoder", e))?;

        String::from_utf8(buffer).map_err(|e| metric_error("encoder", e))
    }
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: impl std::fmt::Display) -> InventoryError {
    InventoryError::validation(format!("metric {name}: {e}"))
}

/// Run `f` against the global metrics, if they are available
#[cfg(feature = "metrics")]
pub(crate) fn with_metrics<F: FnOnce(&InventoryMetrics)>(f: F) {
    if let Some(metrics) = InventoryMetrics::global() {
        f(metrics);
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise hwinv crates log at `info`, or
/// `debug` when `verbose` is set.
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `verbose` - Lower the default level to `debug`
pub fn init_tracing(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    InventoryMetrics::global();

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "hwinv={default_level},hwinv_core={default_level},hwinv_retry={default_level}"
        ))
    })
    .map_err(|e| InventoryError::validation(format!("invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        InventoryError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_cleanly() {
        let _ = init_tracing(false, false);
        assert!(init_tracing(true, true).is_err());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let metrics = InventoryMetrics::global().unwrap();

        metrics.record_cycle("firmware", "reported");
        metrics.record_pull_failure("processor");
        metrics.record_upload_failure("firmware", "client");
        metrics.record_reported("firmware", 3);
        metrics.record_upload_latency("bios", Duration::from_millis(40));

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("hwinv_cycles_total"));
        assert!(text.contains(r#"outcome="reported""#));
        assert!(text.contains("hwinv_records_reported_total"));
        assert!(text.contains("hwinv_upload_latency_seconds"));
    }
}
