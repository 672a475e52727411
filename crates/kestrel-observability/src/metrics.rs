//! Task run counters and duration histograms.
//!
//! Wrappers talk to a [`MetricsSink`]. [`OtelMetrics`] records into
//! OpenTelemetry instruments; whichever meter provider is installed decides
//! where they are exported. [`init_metrics_exporter`] installs an OTLP one.

use std::fmt::{self, Display};
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Instrumentation scope of every kestrel instrument.
pub const METER_NAME: &str = "kestrel";

/// Counter of finished task runs, labelled by `task_name` and `status`.
pub const TASK_RUNS_METRIC: &str = "task_runs_total";

/// Histogram of task wall-clock durations, labelled by `task_name`.
pub const TASK_DURATION_METRIC: &str = "task_duration_seconds";

/// Latency bucket boundaries (seconds) of the duration histogram.
pub const DEFAULT_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Outcome of a single task run, as reported in the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    ExpectedError,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::ExpectedError => "expected-error",
            RunStatus::Error => "error",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for task metrics.
pub trait MetricsSink: Send + Sync {
    /// Record how long one invocation of `task_name` took.
    fn observe_duration(&self, task_name: &str, elapsed: Duration);

    /// Count one finished run of `task_name` with the given outcome.
    fn inc_runs(&self, task_name: &str, status: RunStatus);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_duration(&self, _task_name: &str, _elapsed: Duration) {}

    fn inc_runs(&self, _task_name: &str, _status: RunStatus) {}
}

/// OpenTelemetry-backed sink.
#[derive(Clone)]
pub struct OtelMetrics {
    runs: Counter<u64>,
    durations: Histogram<f64>,
}

impl fmt::Debug for OtelMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelMetrics").finish_non_exhaustive()
    }
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            runs: meter
                .u64_counter(TASK_RUNS_METRIC)
                .with_description("Finished task runs by outcome")
                .build(),
            durations: meter
                .f64_histogram(TASK_DURATION_METRIC)
                .with_description("Task wall-clock duration")
                .with_unit("s")
                .with_boundaries(DEFAULT_BUCKETS.to_vec())
                .build(),
        }
    }

    /// Instruments on the global meter provider; a no-op until one is installed.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }
}

fn task_name_attr(task_name: &str) -> KeyValue {
    KeyValue::new("task_name", task_name.to_owned())
}

impl MetricsSink for OtelMetrics {
    fn observe_duration(&self, task_name: &str, elapsed: Duration) {
        self.durations
            .record(elapsed.as_secs_f64(), &[task_name_attr(task_name)]);
    }

    fn inc_runs(&self, task_name: &str, status: RunStatus) {
        self.runs.add(
            1,
            &[task_name_attr(task_name), KeyValue::new("status", status.as_str())],
        );
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to build metrics exporter: {0}")]
    Exporter(String),
}

/// Install a global meter provider exporting over OTLP/HTTP every `interval`.
///
/// Keep the returned provider and call `shutdown` on it before exit so the
/// last batch is flushed.
pub fn init_metrics_exporter(
    endpoint: &str,
    interval: Duration,
) -> Result<SdkMeterProvider, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| MetricsError::Exporter(err.to_string()))?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(METER_NAME).build())
        .build();

    global::set_meter_provider(provider.clone());
    info!(endpoint, interval_secs = interval.as_secs(), "metrics exporter installed");

    Ok(provider)
}
