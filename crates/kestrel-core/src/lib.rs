//! Background task wrappers: run-time instrumentation and submission that
//! waits for the enclosing transaction to commit.
//!
//! ```ignore
//! let instrumentation = Instrumentation::new(InstrumentationConfig::load(None)?)?;
//! let queue = Arc::new(TaskQueue::new(128));
//! let task = TransactionAwareTask::new(InstrumentedTask::new(SendMail, instrumentation), queue.clone());
//!
//! let mut tx = Transaction::begin();
//! task.delay(&mut tx, TaskArgs::new().arg(order_id));
//! tx.commit(); // published here, not before
//! ```

pub mod config;
pub mod deferred;
pub mod error;
pub mod ids;
pub mod instrumented;
pub mod task;
pub mod task_queue;
pub mod transaction;

pub use crate::config::{CONFIG_ENV_PREFIX, ConfigError, InstrumentationConfig};
pub use deferred::TransactionAwareTask;
pub use error::{ExpectedFailures, FailureKind, TaskError};
pub use ids::TaskId;
pub use instrumented::{Instrumentation, InstrumentedTask};
pub use task::{SubmitOptions, TaskArgs, TaskBody, TaskMessage};
pub use task_queue::{QueueError, TaskBroker, TaskQueue};
pub use transaction::{
    Autocommit, CommitCallback, CommitHook, Savepoint, Transaction, TransactionError,
};
