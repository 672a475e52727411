use std::{sync::Arc, time::Duration};

use kestrel_core::{
    ExpectedFailures, FailureKind, Instrumentation, InstrumentationConfig, InstrumentedTask,
    SubmitOptions, TaskArgs, TaskBody, TaskError, TaskQueue, Transaction, TransactionAwareTask,
};
use kestrel_observability::{init_metrics_exporter, init_tracing};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tracing::{error, info};

struct SendReceipt;

impl TaskBody for SendReceipt {
    fn name(&self) -> &str {
        "orders.send_receipt"
    }

    fn throws(&self) -> ExpectedFailures {
        ExpectedFailures::of(&[FailureKind::NotFound])
    }

    async fn run(&self, args: &TaskArgs) -> Result<Value, TaskError> {
        let order: u64 = args.positional(0)?;
        sleep(Duration::from_millis(20)).await;

        if order == 0 {
            return Err(TaskError::not_found("order 0 does not exist"));
        }
        Ok(json!({ "order": order, "sent": true }))
    }
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    info!("starting worker demo");

    let config = match InstrumentationConfig::load(None) {
        Ok(config) => config.with_metrics(true),
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return;
        }
    };

    // Without an endpoint the global meter stays a no-op
    let meter_provider = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => match init_metrics_exporter(&endpoint, Duration::from_secs(5)) {
            Ok(provider) => Some(provider),
            Err(err) => {
                error!(error = %err, "metrics exporter unavailable");
                None
            }
        },
        Err(_) => None,
    };

    let instrumentation = match Instrumentation::new(config) {
        Ok(instrumentation) => instrumentation,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return;
        }
    };

    let queue = Arc::new(TaskQueue::new(10));
    let task = Arc::new(TransactionAwareTask::new(
        InstrumentedTask::new(SendReceipt, instrumentation),
        queue.clone(),
    ));

    // Committed: both messages are published at commit time
    let mut tx = Transaction::begin();
    task.delay(&mut tx, TaskArgs::new().arg(1001));
    task.apply_async(
        &mut tx,
        TaskArgs::new().arg(1002),
        SubmitOptions::countdown(Duration::from_secs(1)),
    );
    tx.commit();

    // Rolled back: nothing is published
    let mut tx = Transaction::begin();
    task.delay(&mut tx, TaskArgs::new().arg(2001));
    tx.rollback();

    // Committed, but the order is gone: counted as expected-error
    let mut tx = Transaction::begin();
    task.delay(&mut tx, TaskArgs::new().arg(0));
    tx.commit();

    info!(ready = queue.len(), "transactions finished");

    let worker_queue = Arc::clone(&queue);
    let worker_task = Arc::clone(&task);

    let worker = tokio::spawn(async move {
        while let Some(message) = worker_queue.dequeue().await {
            match worker_task.execute(&message).await {
                Ok(retval) => info!(task_id = %message.id, %retval, "worker finished task"),
                Err(err) => info!(task_id = %message.id, error = %err, "worker saw failure"),
            }
        }
    });

    // Let the delayed message come due
    sleep(Duration::from_secs(2)).await;

    info!("shutting down worker");
    queue.shutdown().await;

    if timeout(Duration::from_secs(1), worker).await.is_err() {
        error!("worker did not stop in time");
    }

    if let Some(provider) = meter_provider {
        if let Err(err) = provider.shutdown() {
            error!(error = %err, "failed to flush metrics");
        }
    }
}
