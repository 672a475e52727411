use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::{TaskMessage, task_queue::messages::SchedulerCommand};

/// How long a due message waits before retrying a full ready channel.
const READY_RETRY: Duration = Duration::from_millis(10);

/// Holds countdown messages until they are due, then moves them to the ready channel.
///
/// Never waits on the ready channel: a due message that finds it full is
/// re-armed, so a `Shutdown` command is always read.
pub(crate) async fn scheduler_loop(
    ready_tx: mpsc::Sender<TaskMessage>,
    mut cmd_rx: mpsc::Receiver<SchedulerCommand>,
    len: Arc<AtomicUsize>,
) {
    let mut delay_queue = DelayQueue::<TaskMessage>::new();

    info!("delay scheduler started");

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SchedulerCommand::Schedule { message, delay } => {
                        debug!(
                            task_id = %message.id,
                            task_name = %message.task,
                            delay_ms = delay.as_millis(),
                            "message scheduled"
                        );
                        delay_queue.insert(message, delay);
                    }

                    SchedulerCommand::Shutdown => break,
                }
            }

            Some(expired) = delay_queue.next() => {
                let message = expired.into_inner();
                match ready_tx.try_reserve() {
                    Ok(permit) => {
                        len.fetch_add(1, Ordering::SeqCst);
                        permit.send(message);
                    }
                    Err(mpsc::error::TrySendError::Full(())) => {
                        debug!(task_id = %message.id, "ready channel full, retrying delayed message");
                        delay_queue.insert(message, READY_RETRY);
                    }
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        warn!(task_id = %message.id, "ready channel closed, delayed message dropped");
                    }
                }
            }

            else => {
                break;
            }
        }
    }

    if !delay_queue.is_empty() {
        warn!(pending = delay_queue.len(), "delay scheduler stopped with pending messages");
    }

    info!("delay scheduler exited");
}
