//! Sampled profiling of task invocations.
//!
//! A [`ProfileSampler`] decides per call whether to profile. When it does,
//! a [`Profiler`] opens a [`ProfileSession`] around the call, and the bytes it
//! produces are written to the profile directory under a name built by
//! [`profile_file_name`]. The on-disk format belongs to the profiler; the
//! bundled [`SpanProfiler`] writes a JSON report of the span timings it
//! collected while the call ran.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::span::{Attributes, Id};
use tracing::{Metadata, Span, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::{LookupSpan, SpanRef};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to write profile to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode profile: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Percentage-based sampling decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileSampler {
    rate: f64,
}

impl ProfileSampler {
    /// `rate` is a percentage, clamped to `0..=100`. NaN disables sampling.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 100.0) };
        Self { rate }
    }

    pub fn disabled() -> Self {
        Self { rate: 0.0 }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_profile(&self) -> bool {
        self.should_profile_with(&mut rand::rng())
    }

    /// Same as [`should_profile`](Self::should_profile) with a caller-supplied RNG.
    pub fn should_profile_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        rng.random::<f64>() < self.rate / 100.0
    }
}

/// Starts a profiling session around one invocation.
pub trait Profiler: Send + Sync {
    fn start(&self, task_name: &str) -> Box<dyn ProfileSession>;
}

/// A running profile. `finish` returns the encoded output.
pub trait ProfileSession: Send {
    /// Span the profiled call must run inside.
    fn span(&self) -> Span;

    fn finish(self: Box<Self>, elapsed: Duration) -> Result<Vec<u8>, ProfileError>;
}

/// Aggregated timings of one span name inside a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSample {
    pub target: String,
    pub name: String,
    /// Times the span was entered, counting every poll of an instrumented future.
    pub calls: u64,
    /// Time spent inside the span, excluding time suspended between polls.
    pub busy_seconds: f64,
}

#[derive(Debug, Default)]
struct SpanStats {
    calls: u64,
    busy: Duration,
}

#[derive(Debug, Default)]
struct Collector {
    spans: Mutex<BTreeMap<(&'static str, &'static str), SpanStats>>,
}

impl Collector {
    fn record(&self, metadata: &'static Metadata<'static>, busy: Duration) {
        let mut spans = self.spans.lock();
        let stats = spans.entry((metadata.target(), metadata.name())).or_default();
        stats.calls += 1;
        stats.busy += busy;
    }

    fn samples(&self) -> Vec<SpanSample> {
        let mut samples: Vec<SpanSample> = self
            .spans
            .lock()
            .iter()
            .map(|((target, name), stats)| SpanSample {
                target: (*target).to_owned(),
                name: (*name).to_owned(),
                calls: stats.calls,
                busy_seconds: stats.busy.as_secs_f64(),
            })
            .collect();
        samples.sort_by(|a, b| b.busy_seconds.total_cmp(&a.busy_seconds));
        samples
    }
}

#[derive(Debug, Default)]
struct Sessions {
    roots: Mutex<HashMap<Id, Arc<Collector>>>,
}

/// Profiles a call by timing every span entered beneath its session span.
///
/// Sessions only see spans while [`SpanProfiler::layer`] is part of the
/// installed subscriber. [`init_tracing`](crate::init_tracing) installs the
/// layer of [`SpanProfiler::global`].
#[derive(Debug, Default, Clone)]
pub struct SpanProfiler {
    sessions: Arc<Sessions>,
}

static GLOBAL_PROFILER: LazyLock<SpanProfiler> = LazyLock::new(SpanProfiler::new);

impl SpanProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide profiler whose layer `init_tracing` installs.
    pub fn global() -> &'static SpanProfiler {
        &GLOBAL_PROFILER
    }

    pub fn layer(&self) -> SpanProfilerLayer {
        SpanProfilerLayer {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl Profiler for SpanProfiler {
    fn start(&self, task_name: &str) -> Box<dyn ProfileSession> {
        let span = tracing::info_span!(target: "kestrel::profile", "profile", task_name = %task_name);
        let collector = Arc::new(Collector::default());

        if let Some(id) = span.id() {
            self.sessions.roots.lock().insert(id, Arc::clone(&collector));
        }

        Box::new(SpanSession {
            task_name: task_name.to_owned(),
            started_at: Utc::now(),
            span,
            collector,
            sessions: Arc::clone(&self.sessions),
        })
    }
}

struct SpanSession {
    task_name: String,
    started_at: DateTime<Utc>,
    span: Span,
    collector: Arc<Collector>,
    sessions: Arc<Sessions>,
}

impl Drop for SpanSession {
    fn drop(&mut self) {
        if let Some(id) = self.span.id() {
            self.sessions.roots.lock().remove(&id);
        }
    }
}

#[derive(Debug, Serialize)]
struct SpanReport<'a> {
    task_name: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed_seconds: f64,
    pid: u32,
    spans: Vec<SpanSample>,
}

impl ProfileSession for SpanSession {
    fn span(&self) -> Span {
        self.span.clone()
    }

    fn finish(self: Box<Self>, elapsed: Duration) -> Result<Vec<u8>, ProfileError> {
        let report = SpanReport {
            task_name: &self.task_name,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_seconds: elapsed.as_secs_f64(),
            pid: std::process::id(),
            spans: self.collector.samples(),
        };
        Ok(serde_json::to_vec_pretty(&report)?)
    }
}

/// `tracing` layer feeding [`SpanProfiler`] sessions.
#[derive(Debug, Clone)]
pub struct SpanProfilerLayer {
    sessions: Arc<Sessions>,
}

// start times of the currently open enters, innermost last
struct Entered(Vec<Instant>);

impl SpanProfilerLayer {
    fn collector_for<S>(&self, span: &SpanRef<'_, S>) -> Option<Arc<Collector>>
    where
        S: for<'a> LookupSpan<'a>,
    {
        // a session root owns its collector even when nested in another session
        if let Some(collector) = self.sessions.roots.lock().get(&span.id()) {
            return Some(Arc::clone(collector));
        }
        span.extensions().get::<Arc<Collector>>().cloned()
    }
}

impl<S> Layer<S> for SpanProfilerLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, _attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let collector = span.parent().and_then(|parent| self.collector_for(&parent));
        if let Some(collector) = collector {
            span.extensions_mut().insert(collector);
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        if self.collector_for(&span).is_none() {
            return;
        }

        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Entered>() {
            Some(entered) => entered.0.push(Instant::now()),
            None => extensions.insert(Entered(vec![Instant::now()])),
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let Some(collector) = self.collector_for(&span) else {
            return;
        };

        let started = span
            .extensions_mut()
            .get_mut::<Entered>()
            .and_then(|entered| entered.0.pop());
        if let Some(started) = started {
            collector.record(span.metadata(), started.elapsed());
        }
    }
}

/// `{epoch:.0}_{elapsed:.3}_celery_{task_name}.pstat`
///
/// Path separators in the task name are replaced so the file always lands
/// directly inside the profile directory.
pub fn profile_file_name(epoch_seconds: f64, elapsed: Duration, task_name: &str) -> String {
    let task_name = task_name.replace(['/', '\\'], "_");
    format!(
        "{:.0}_{:.3}_celery_{}.pstat",
        epoch_seconds,
        elapsed.as_secs_f64(),
        task_name
    )
}

/// Write `data` into `dir`, creating the directory if needed.
pub fn write_profile(
    dir: &Path,
    task_name: &str,
    elapsed: Duration,
    data: &[u8],
) -> Result<PathBuf, ProfileError> {
    let now = Utc::now();
    let epoch_seconds = now.timestamp_micros() as f64 / 1_000_000.0;
    let path = dir.join(profile_file_name(epoch_seconds, elapsed, task_name));

    fs::create_dir_all(dir).map_err(|source| ProfileError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(&path, data).map_err(|source| ProfileError::Io {
        path: path.clone(),
        source,
    })?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn file_name_format() {
        let name = profile_file_name(1_700_000_000.4, Duration::from_millis(1234), "orders.export");
        assert_eq!(name, "1700000000_1.234_celery_orders.export.pstat");
    }

    #[test]
    fn file_name_strips_separators() {
        let name = profile_file_name(10.0, Duration::ZERO, "../evil/task");
        assert_eq!(name, "10_0.000_celery_.._evil_task.pstat");
    }

    #[test]
    fn zero_rate_never_samples() {
        let sampler = ProfileSampler::new(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!((0..1_000).all(|_| !sampler.should_profile_with(&mut rng)));
        assert!(!ProfileSampler::new(f64::NAN).should_profile());
    }

    #[test]
    fn full_rate_always_samples() {
        let sampler = ProfileSampler::new(250.0);
        assert_eq!(sampler.rate(), 100.0);
        let mut rng = StdRng::seed_from_u64(2);
        assert!((0..1_000).all(|_| sampler.should_profile_with(&mut rng)));
    }

    #[test]
    fn sampled_fraction_converges_to_rate() {
        let sampler = ProfileSampler::new(5.0);
        let mut rng = StdRng::seed_from_u64(42);
        let runs = 100_000;

        let hits = (0..runs)
            .filter(|_| sampler.should_profile_with(&mut rng))
            .count();

        let fraction = hits as f64 / runs as f64;
        assert!((fraction - 0.05).abs() < 0.005, "fraction was {fraction}");
    }

    fn span_report(data: &[u8]) -> Vec<SpanSample> {
        let report: serde_json::Value = serde_json::from_slice(data).unwrap();
        serde_json::from_value(report["spans"].clone()).unwrap()
    }

    #[test]
    fn samples_spans_entered_inside_the_session() {
        let profiler = SpanProfiler::new();
        let subscriber = tracing_subscriber::registry().with(profiler.layer());

        tracing::subscriber::with_default(subscriber, || {
            let session = profiler.start("orders.export");

            session.span().in_scope(|| {
                for _ in 0..3 {
                    let _query = tracing::debug_span!("db.query").entered();
                    std::thread::sleep(Duration::from_millis(2));
                }
            });
            tracing::debug_span!("unrelated").in_scope(|| {});

            let samples = span_report(&session.finish(Duration::from_millis(10)).unwrap());

            let query = samples.iter().find(|s| s.name == "db.query").unwrap();
            assert_eq!(query.calls, 3);
            assert!(query.busy_seconds >= 0.006, "busy was {}", query.busy_seconds);

            let root = samples.iter().find(|s| s.name == "profile").unwrap();
            assert_eq!(root.target, "kestrel::profile");
            assert!(root.busy_seconds >= query.busy_seconds);

            assert!(samples.iter().all(|s| s.name != "unrelated"));
        });
    }

    #[test]
    fn concurrent_sessions_keep_their_own_samples() {
        let profiler = SpanProfiler::new();
        let subscriber = tracing_subscriber::registry().with(profiler.layer());

        tracing::subscriber::with_default(subscriber, || {
            let first = profiler.start("first");
            let second = profiler.start("second");

            first.span().in_scope(|| tracing::info_span!("encode").in_scope(|| {}));
            second.span().in_scope(|| tracing::info_span!("upload").in_scope(|| {}));

            let first = span_report(&first.finish(Duration::ZERO).unwrap());
            let second = span_report(&second.finish(Duration::ZERO).unwrap());

            assert!(first.iter().any(|s| s.name == "encode"));
            assert!(first.iter().all(|s| s.name != "upload"));
            assert!(second.iter().any(|s| s.name == "upload"));
            assert!(second.iter().all(|s| s.name != "encode"));
        });
    }

    #[test]
    fn writes_span_report() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("profiles");

        let session = SpanProfiler::new().start("orders.export");
        let data = session.finish(Duration::from_millis(20)).unwrap();
        let path = write_profile(&nested, "orders.export", Duration::from_millis(20), &data).unwrap();

        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.ends_with("_0.020_celery_orders.export.pstat"));

        let report: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(report["task_name"], "orders.export");
        assert_eq!(report["elapsed_seconds"], 0.02);
        assert!(report["spans"].is_array());
    }
}
