//! Submission that waits for the surrounding transaction to commit.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::{
    InstrumentedTask, SubmitOptions, TaskArgs, TaskBody, TaskError, TaskMessage,
    instrumented::publish,
    task_queue::TaskBroker,
    transaction::CommitHook,
};

/// An [`InstrumentedTask`] whose submissions are held back until commit.
///
/// Messages are only published from the commit callback, so a worker can
/// never see a task whose originating transaction has not committed. On
/// rollback nothing is published and nothing is reported.
pub struct TransactionAwareTask<T> {
    inner: InstrumentedTask<T>,
    broker: Arc<dyn TaskBroker>,
}

impl<T: fmt::Debug> fmt::Debug for TransactionAwareTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionAwareTask")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<T: TaskBody> TransactionAwareTask<T> {
    pub fn new(inner: InstrumentedTask<T>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { inner, broker }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn inner(&self) -> &InstrumentedTask<T> {
        &self.inner
    }

    /// Register the submission with `hook`; it is published once the hook
    /// commits. No handle is returned because no message exists yet.
    pub fn apply_async<H: CommitHook + ?Sized>(
        &self,
        hook: &mut H,
        args: TaskArgs,
        options: SubmitOptions,
    ) {
        let broker = Arc::clone(&self.broker);
        let task_name = self.inner.name().to_owned();

        hook.on_commit(Box::new(move || {
            if let Err(err) = publish(broker.as_ref(), &task_name, args, options) {
                error!(task_name = %task_name, error = %err, "submission after commit failed");
            }
        }));
    }

    pub fn delay<H: CommitHook + ?Sized>(&self, hook: &mut H, args: TaskArgs) {
        self.apply_async(hook, args, SubmitOptions::default());
    }

    /// Invocation is unchanged; see [`InstrumentedTask::execute`].
    pub async fn execute(&self, message: &TaskMessage) -> Result<Value, TaskError> {
        self.inner.execute(message).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        Autocommit, Instrumentation, InstrumentationConfig, QueueError, Transaction,
    };

    #[derive(Default)]
    struct CapturingBroker {
        published: Mutex<Vec<TaskMessage>>,
        reject: bool,
    }

    impl TaskBroker for CapturingBroker {
        fn publish(&self, message: TaskMessage) -> Result<(), QueueError> {
            if self.reject {
                return Err(QueueError::Closed);
            }
            self.published.lock().push(message);
            Ok(())
        }
    }

    struct Noop;

    impl TaskBody for Noop {
        fn name(&self) -> &str {
            "mail.send"
        }

        async fn run(&self, _args: &TaskArgs) -> Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    fn deferred(broker: Arc<CapturingBroker>) -> TransactionAwareTask<Noop> {
        let instrumentation = Instrumentation::new(InstrumentationConfig::default()).unwrap();
        TransactionAwareTask::new(InstrumentedTask::new(Noop, instrumentation), broker)
    }

    #[test]
    fn publishes_once_after_commit() {
        let broker = Arc::new(CapturingBroker::default());
        let task = deferred(broker.clone());
        let args = TaskArgs::new().arg(7).kwarg("locale", "de");
        let options = SubmitOptions::countdown(Duration::from_secs(30));

        let mut tx = Transaction::begin();
        task.apply_async(&mut tx, args.clone(), options.clone());
        assert!(broker.published.lock().is_empty());

        tx.commit();

        let published = broker.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].task, "mail.send");
        assert_eq!(published[0].args, args);
        assert_eq!(published[0].options, options);
    }

    #[test]
    fn rollback_publishes_nothing() {
        let broker = Arc::new(CapturingBroker::default());
        let task = deferred(broker.clone());

        let mut tx = Transaction::begin();
        task.delay(&mut tx, TaskArgs::new().arg(1));
        tx.rollback();

        assert!(broker.published.lock().is_empty());
    }

    #[test]
    fn savepoint_rollback_drops_only_inner_submission() {
        let broker = Arc::new(CapturingBroker::default());
        let task = deferred(broker.clone());

        let mut tx = Transaction::begin();
        task.delay(&mut tx, TaskArgs::new().arg("kept"));
        let sp = tx.savepoint();
        task.delay(&mut tx, TaskArgs::new().arg("dropped"));
        tx.rollback_to(sp).unwrap();
        tx.commit();

        let published = broker.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].args, TaskArgs::new().arg("kept"));
    }

    #[test]
    fn autocommit_publishes_immediately() {
        let broker = Arc::new(CapturingBroker::default());
        let task = deferred(broker.clone());

        task.delay(&mut Autocommit, TaskArgs::new());

        assert_eq!(broker.published.lock().len(), 1);
    }

    #[test]
    fn broker_failure_after_commit_is_not_raised() {
        let broker = Arc::new(CapturingBroker {
            reject: true,
            ..Default::default()
        });
        let task = deferred(broker.clone());

        let mut tx = Transaction::begin();
        task.delay(&mut tx, TaskArgs::new());

        assert_eq!(tx.commit(), 1);
        assert!(broker.published.lock().is_empty());
    }
}
