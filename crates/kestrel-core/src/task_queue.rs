//! Broker seam and a bounded in-memory broker.

mod errors;
mod messages;
mod scheduler;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use errors::QueueError;
use messages::SchedulerCommand;
use scheduler::scheduler_loop;

use crate::TaskMessage;

const SCHEDULER_BACKLOG: usize = 1024;

/// Something that accepts task messages for later execution.
///
/// `publish` must not block: it is called from commit callbacks.
pub trait TaskBroker: Send + Sync {
    fn publish(&self, message: TaskMessage) -> Result<(), QueueError>;
}

impl<B: TaskBroker + ?Sized> TaskBroker for Arc<B> {
    fn publish(&self, message: TaskMessage) -> Result<(), QueueError> {
        (**self).publish(message)
    }
}

/// Bounded in-memory broker.
///
/// Messages with a countdown wait in a background scheduler until they are
/// due. Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct TaskQueue {
    ready_tx: Mutex<Option<mpsc::Sender<TaskMessage>>>,
    ready_rx: AsyncMutex<mpsc::Receiver<TaskMessage>>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    len: Arc<AtomicUsize>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "initializing task queue");

        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_BACKLOG);
        let len = Arc::new(AtomicUsize::new(0));

        let scheduler_handle = tokio::spawn(scheduler_loop(
            ready_tx.clone(),
            scheduler_rx,
            len.clone(),
        ));

        Self {
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: AsyncMutex::new(ready_rx),
            scheduler_tx,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            len,
            capacity,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<TaskMessage>, QueueError> {
        self.ready_tx.lock().clone().ok_or(QueueError::Closed)
    }

    /// Wait for room and enqueue, ignoring any countdown.
    pub async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        debug!(task_id = %message.id, task_name = %message.task, "enqueue message");

        let sender = self.sender()?;
        let permit = sender.reserve().await.map_err(|_| {
            warn!("enqueue failed: queue closed");
            QueueError::Closed
        })?;

        // counted before the message becomes visible to `dequeue`
        self.len.fetch_add(1, Ordering::SeqCst);
        permit.send(message);
        Ok(())
    }

    pub async fn dequeue(&self) -> Option<TaskMessage> {
        let mut receiver = self.ready_rx.lock().await;
        let message = receiver.recv().await;

        if let Some(ref message) = message {
            debug!(task_id = %message.id, task_name = %message.task, "message dequeued");
            self.len.fetch_sub(1, Ordering::SeqCst);
        } else {
            debug!("receiver closed");
        }

        message
    }

    /// Messages ready to be dequeued. Delayed messages count once they are due.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.ready_tx.lock().is_none()
    }

    /// Stop accepting messages and stop the scheduler.
    ///
    /// Ready messages can still be drained with [`dequeue`](Self::dequeue);
    /// delayed messages that are not yet due are dropped.
    pub async fn shutdown(&self) {
        info!("task queue shutdown initiated");

        self.ready_tx.lock().take();

        let _ = self.scheduler_tx.send(SchedulerCommand::Shutdown).await;

        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("task queue shutdown complete");
    }
}

impl TaskBroker for TaskQueue {
    fn publish(&self, message: TaskMessage) -> Result<(), QueueError> {
        let sender = self.sender()?;

        match message.options.countdown {
            Some(delay) if !delay.is_zero() => {
                debug!(
                    task_id = %message.id,
                    task_name = %message.task,
                    delay_ms = delay.as_millis(),
                    "publish delayed message"
                );
                self.scheduler_tx
                    .try_send(SchedulerCommand::Schedule { message, delay })
                    .map_err(|err| match err {
                        mpsc::error::TrySendError::Full(_) => QueueError::Full,
                        mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
                    })
            }
            _ => {
                debug!(task_id = %message.id, task_name = %message.task, "publish message");
                let permit = sender.try_reserve().map_err(|err| match err {
                    mpsc::error::TrySendError::Full(()) => QueueError::Full,
                    mpsc::error::TrySendError::Closed(()) => QueueError::Closed,
                })?;
                self.len.fetch_add(1, Ordering::SeqCst);
                permit.send(message);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{SubmitOptions, TaskArgs};

    fn message(name: &str) -> TaskMessage {
        TaskMessage::new(name, TaskArgs::new(), SubmitOptions::default())
    }

    #[tokio::test]
    async fn fifo_publish_dequeue() {
        let queue = TaskQueue::new(10);

        let m1 = message("a");
        let m2 = message("b");

        queue.publish(m1.clone()).unwrap();
        queue.publish(m2.clone()).unwrap();
        assert_eq!(queue.len(), 2);

        let r1 = queue.dequeue().await.unwrap();
        let r2 = queue.dequeue().await.unwrap();

        assert_eq!(r1.id, m1.id);
        assert_eq!(r2.id, m2.id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn publish_fails_fast_when_full() {
        let queue = TaskQueue::new(1);
        queue.publish(message("a")).unwrap();

        assert_eq!(queue.publish(message("b")), Err(QueueError::Full));
    }

    #[tokio::test]
    async fn enqueue_waits_for_capacity() {
        let queue = TaskQueue::new(1);
        queue.enqueue(message("a")).await.unwrap();

        let fut = queue.enqueue(message("b"));
        assert!(timeout(Duration::from_millis(50), fut).await.is_err());

        queue.dequeue().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_holds_message_back() {
        let queue = TaskQueue::new(5);
        let delayed = TaskMessage::new(
            "reminder",
            TaskArgs::new(),
            SubmitOptions::countdown(Duration::from_secs(10)),
        );
        let id = delayed.id.clone();

        queue.publish(delayed).unwrap();
        assert_eq!(queue.len(), 0);

        assert!(timeout(Duration::from_secs(9), queue.dequeue()).await.is_err());

        let out = timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_completes_while_ready_channel_is_full() {
        let queue = TaskQueue::new(1);
        queue.publish(message("ready")).unwrap();
        queue
            .publish(TaskMessage::new(
                "delayed",
                TaskArgs::new(),
                SubmitOptions::countdown(Duration::from_millis(10)),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(2), queue.shutdown())
            .await
            .expect("shutdown blocked on a full ready channel");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await.unwrap().task, "ready");
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn due_message_waits_for_room() {
        let queue = TaskQueue::new(1);
        queue.publish(message("first")).unwrap();
        queue
            .publish(TaskMessage::new(
                "second",
                TaskArgs::new(),
                SubmitOptions::countdown(Duration::from_millis(10)),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue().await.unwrap().task, "first");
        let second = timeout(Duration::from_secs(1), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.task, "second");
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn len_stays_bounded_under_concurrent_traffic() {
        let queue = Arc::new(TaskQueue::new(4));
        let total = 2_000;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..total {
                    queue.enqueue(message(&format!("m{i}"))).await.unwrap();
                }
            })
        };

        for _ in 0..total {
            queue.dequeue().await.unwrap();
            // one dequeue at a time can lag its decrement behind a new enqueue
            assert!(queue.len() <= queue.capacity() + 1, "len was {}", queue.len());
        }

        producer.await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_queue() {
        let queue = TaskQueue::new(5);
        queue.publish(message("a")).unwrap();

        queue.shutdown().await;

        assert!(queue.is_closed());
        assert_eq!(queue.publish(message("b")), Err(QueueError::Closed));
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }
}
