//! Timing, sampled profiling and outcome counters around task invocations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kestrel_observability::{
    MetricsSink, OtelMetrics, ProfileSampler, ProfileSession, Profiler, RunStatus, SpanProfiler,
    write_profile,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    ConfigError, InstrumentationConfig, SubmitOptions, TaskArgs, TaskBody, TaskError, TaskId,
    TaskMessage,
    task_queue::{QueueError, TaskBroker},
};

/// Shared instrumentation settings and sinks. Cheap to clone.
#[derive(Clone)]
pub struct Instrumentation {
    config: InstrumentationConfig,
    sampler: ProfileSampler,
    metrics: Arc<dyn MetricsSink>,
    profiler: Arc<dyn Profiler>,
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Instrumentation {
    /// Validates `config`. Metrics go to the global OpenTelemetry meter and
    /// profiles come from [`SpanProfiler::global`] until replaced.
    pub fn new(config: InstrumentationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            sampler: ProfileSampler::new(config.profiling_rate),
            config,
            metrics: Arc::new(OtelMetrics::global()),
            profiler: Arc::new(SpanProfiler::global().clone()),
        })
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_profiler(mut self, profiler: Arc<dyn Profiler>) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    fn persist_profile(&self, task_name: &str, session: Box<dyn ProfileSession>, elapsed: Duration) {
        let written = session
            .finish(elapsed)
            .and_then(|data| write_profile(&self.config.profile_dir, task_name, elapsed, &data));

        match written {
            Ok(path) => debug!(task_name, path = %path.display(), "profile written"),
            Err(err) => warn!(task_name, error = %err, "failed to write profile"),
        }
    }
}

/// A task body wrapped with timing, sampled profiling and run counters.
#[derive(Debug)]
pub struct InstrumentedTask<T> {
    body: T,
    instrumentation: Instrumentation,
}

impl<T: TaskBody> InstrumentedTask<T> {
    pub fn new(body: T, instrumentation: Instrumentation) -> Self {
        Self {
            body,
            instrumentation,
        }
    }

    pub fn name(&self) -> &str {
        self.body.name()
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Run the body and return its result untouched.
    ///
    /// A sampled fraction of calls runs under a profile session. Only
    /// successful calls have their duration observed (when metrics are
    /// enabled) and their profile written; a failed call's session is dropped.
    pub async fn call(&self, args: &TaskArgs) -> Result<Value, TaskError> {
        let name = self.body.name();
        let instrumentation = &self.instrumentation;

        let session = instrumentation
            .sampler
            .should_profile()
            .then(|| instrumentation.profiler.start(name));

        let started = Instant::now();
        let result = match &session {
            Some(session) => self.body.run(args).instrument(session.span()).await,
            None => self.body.run(args).await,
        };
        let elapsed = started.elapsed();

        if result.is_ok() {
            if let Some(session) = session {
                instrumentation.persist_profile(name, session, elapsed);
            }

            if instrumentation.config.metrics_enabled {
                instrumentation.metrics.observe_duration(name, elapsed);
            }
        }

        result
    }

    pub fn on_success(&self, retval: &Value, task_id: &TaskId, args: &TaskArgs) {
        if self.instrumentation.config.metrics_enabled {
            self.instrumentation
                .metrics
                .inc_runs(self.body.name(), RunStatus::Success);
        }

        self.body.on_success(retval, task_id, args);
    }

    /// Count the failure, then hand it to the body's own failure handler.
    pub fn on_failure(&self, err: &TaskError, task_id: &TaskId, args: &TaskArgs) {
        if self.instrumentation.config.metrics_enabled {
            let status = self.body.throws().classify(err);
            self.instrumentation
                .metrics
                .inc_runs(self.body.name(), status);
        }

        self.body.on_failure(err, task_id, args);
    }

    /// Worker entry point: `call` followed by the matching completion hook.
    pub async fn execute(&self, message: &TaskMessage) -> Result<Value, TaskError> {
        let span = info_span!("task", task_name = self.body.name(), task_id = %message.id);

        async {
            let result = self.call(&message.args).await;
            match &result {
                Ok(retval) => self.on_success(retval, &message.id, &message.args),
                Err(err) => self.on_failure(err, &message.id, &message.args),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Publish right away and return the id of the new message.
    pub fn apply_async<B: TaskBroker + ?Sized>(
        &self,
        broker: &B,
        args: TaskArgs,
        options: SubmitOptions,
    ) -> Result<TaskId, QueueError> {
        publish(broker, self.body.name(), args, options)
    }

    pub fn delay<B: TaskBroker + ?Sized>(
        &self,
        broker: &B,
        args: TaskArgs,
    ) -> Result<TaskId, QueueError> {
        self.apply_async(broker, args, SubmitOptions::default())
    }
}

pub(crate) fn publish<B: TaskBroker + ?Sized>(
    broker: &B,
    task_name: &str,
    args: TaskArgs,
    options: SubmitOptions,
) -> Result<TaskId, QueueError> {
    let message = TaskMessage::new(task_name, args, options);
    let task_id = message.id.clone();

    broker.publish(message)?;
    debug!(task_name, %task_id, "task submitted");

    Ok(task_id)
}
