//! In-memory metrics pipeline for tests.

use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_sdk::metrics::data::{Histogram, Metric, ResourceMetrics, Sum};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

use crate::metrics::{METER_NAME, OtelMetrics, RunStatus, TASK_DURATION_METRIC, TASK_RUNS_METRIC};

/// A private meter provider whose exports land in memory.
pub struct InMemoryMetrics {
    provider: SdkMeterProvider,
    exporter: InMemoryMetricExporter,
    sink: Arc<OtelMetrics>,
}

impl fmt::Debug for InMemoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetrics").finish_non_exhaustive()
    }
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        let sink = Arc::new(OtelMetrics::new(&provider.meter(METER_NAME)));

        Self {
            provider,
            exporter,
            sink,
        }
    }

    pub fn sink(&self) -> Arc<OtelMetrics> {
        Arc::clone(&self.sink)
    }

    // cumulative temporality: the latest export holds the totals
    fn latest(&self) -> Option<ResourceMetrics> {
        self.provider.force_flush().ok()?;
        self.exporter.get_finished_metrics().ok()?.pop()
    }

    fn with_metric<R>(&self, name: &str, read: impl Fn(&Metric) -> R, fold: impl Fn(R, R) -> R, zero: R) -> R {
        let Some(resource) = self.latest() else {
            return zero;
        };
        resource
            .scope_metrics
            .iter()
            .flat_map(|scope| &scope.metrics)
            .filter(|metric| metric.name == name)
            .map(read)
            .fold(zero, fold)
    }

    pub fn run_count(&self, task_name: &str, status: RunStatus) -> u64 {
        self.with_metric(
            TASK_RUNS_METRIC,
            |metric| {
                metric
                    .data
                    .as_any()
                    .downcast_ref::<Sum<u64>>()
                    .map(|sum| {
                        sum.data_points
                            .iter()
                            .filter(|point| {
                                has_attr(&point.attributes, "task_name", task_name)
                                    && has_attr(&point.attributes, "status", status.as_str())
                            })
                            .map(|point| point.value)
                            .sum()
                    })
                    .unwrap_or(0)
            },
            |a, b| a + b,
            0,
        )
    }

    pub fn duration_count(&self, task_name: &str) -> u64 {
        self.with_metric(
            TASK_DURATION_METRIC,
            |metric| {
                metric
                    .data
                    .as_any()
                    .downcast_ref::<Histogram<f64>>()
                    .map(|histogram| {
                        histogram
                            .data_points
                            .iter()
                            .filter(|point| has_attr(&point.attributes, "task_name", task_name))
                            .map(|point| point.count)
                            .sum()
                    })
                    .unwrap_or(0)
            },
            |a, b| a + b,
            0,
        )
    }

    pub fn duration_sum(&self, task_name: &str) -> f64 {
        self.with_metric(
            TASK_DURATION_METRIC,
            |metric| {
                metric
                    .data
                    .as_any()
                    .downcast_ref::<Histogram<f64>>()
                    .map(|histogram| {
                        histogram
                            .data_points
                            .iter()
                            .filter(|point| has_attr(&point.attributes, "task_name", task_name))
                            .map(|point| point.sum)
                            .sum()
                    })
                    .unwrap_or(0.0)
            },
            |a, b| a + b,
            0.0,
        )
    }
}

fn has_attr(attributes: &[KeyValue], key: &str, value: &str) -> bool {
    attributes
        .iter()
        .any(|kv| kv.key.as_str() == key && kv.value.as_str() == value)
}
