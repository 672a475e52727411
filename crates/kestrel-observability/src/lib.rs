//! Metrics, sampled profiling and log setup for kestrel task wrappers.

pub mod logging;
pub mod metrics;
pub mod profiling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use logging::init_tracing;
pub use metrics::{
    DEFAULT_BUCKETS, METER_NAME, MetricsError, MetricsSink, NoopMetrics, OtelMetrics, RunStatus,
    TASK_DURATION_METRIC, TASK_RUNS_METRIC, init_metrics_exporter,
};
pub use profiling::{
    ProfileError, ProfileSampler, ProfileSession, Profiler, SpanProfiler, SpanProfilerLayer,
    SpanSample, profile_file_name, write_profile,
};
