//! Run-after-commit callbacks.
//!
//! A [`CommitHook`] is where deferred work is parked until the surrounding
//! unit of work finishes. [`Transaction`] runs its callbacks on commit and
//! forgets them on rollback; [`Autocommit`] stands in when no transaction is
//! open and runs callbacks straight away.

use std::fmt;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Deferred action run at most once, after a successful commit.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait CommitHook {
    fn on_commit(&mut self, callback: CommitCallback);
}

/// No open transaction: callbacks run immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Autocommit;

impl CommitHook for Autocommit {
    fn on_commit(&mut self, callback: CommitCallback) {
        callback();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("savepoint {depth} is not active in transaction {transaction}")]
    UnknownSavepoint { transaction: Uuid, depth: usize },
}

/// Marker returned by [`Transaction::savepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    transaction: Uuid,
    depth: usize,
}

/// A unit of work that owns its commit callbacks.
///
/// Dropping it without calling [`commit`](Self::commit) is a rollback.
pub struct Transaction {
    id: Uuid,
    callbacks: Vec<CommitCallback>,
    // callbacks.len() at the time each open savepoint was taken
    savepoints: Vec<usize>,
    finished: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("pending_callbacks", &self.callbacks.len())
            .field("savepoints", &self.savepoints.len())
            .finish()
    }
}

impl Transaction {
    pub fn begin() -> Self {
        let id = Uuid::new_v4();
        debug!(transaction = %id, "transaction started");
        Self {
            id,
            callbacks: Vec::new(),
            savepoints: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Callbacks that would run if the transaction committed now.
    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    pub fn savepoint(&mut self) -> Savepoint {
        self.savepoints.push(self.callbacks.len());
        Savepoint {
            transaction: self.id,
            depth: self.savepoints.len() - 1,
        }
    }

    fn check(&self, savepoint: Savepoint) -> Result<usize, TransactionError> {
        if savepoint.transaction != self.id || savepoint.depth >= self.savepoints.len() {
            return Err(TransactionError::UnknownSavepoint {
                transaction: self.id,
                depth: savepoint.depth,
            });
        }
        Ok(self.savepoints[savepoint.depth])
    }

    /// Keep the work done since `savepoint`; closes it and any nested savepoints.
    pub fn release(&mut self, savepoint: Savepoint) -> Result<(), TransactionError> {
        self.check(savepoint)?;
        self.savepoints.truncate(savepoint.depth);
        Ok(())
    }

    /// Undo back to `savepoint`, discarding callbacks registered since.
    /// Returns how many callbacks were discarded.
    pub fn rollback_to(&mut self, savepoint: Savepoint) -> Result<usize, TransactionError> {
        let mark = self.check(savepoint)?;
        let discarded = self.callbacks.len() - mark;

        self.callbacks.truncate(mark);
        self.savepoints.truncate(savepoint.depth);

        debug!(transaction = %self.id, discarded, "rolled back to savepoint");
        Ok(discarded)
    }

    /// Commit and run the callbacks in registration order. Returns how many ran.
    pub fn commit(mut self) -> usize {
        self.finished = true;
        let callbacks = std::mem::take(&mut self.callbacks);
        let count = callbacks.len();

        debug!(transaction = %self.id, callbacks = count, "transaction committed");

        for callback in callbacks {
            callback();
        }
        count
    }

    /// Discard the callbacks without running them. Returns how many were discarded.
    pub fn rollback(mut self) -> usize {
        self.finished = true;
        let discarded = std::mem::take(&mut self.callbacks).len();
        debug!(transaction = %self.id, discarded, "transaction rolled back");
        discarded
    }
}

impl CommitHook for Transaction {
    fn on_commit(&mut self, callback: CommitCallback) {
        self.callbacks.push(callback);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                transaction = %self.id,
                discarded = self.callbacks.len(),
                "transaction dropped without commit"
            );
        }
    }
}
