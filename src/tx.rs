//! # External transaction seam.
//!
//! When a [`TransactionManager`] is configured, every batch runs inside a
//! transaction it controls: begin before the first receive, commit after the
//! batch acks, roll back when the listener fails with an error the
//! [`TxAttribute`] considers rollback-worthy. The transactional context is an
//! explicit object threaded through the receive loop; nothing is bound to
//! ambient task-local state.
//!
//! Physical message disposition stays with the container: after the external
//! rollback completes, the worker rejects the batch's delivery tags itself,
//! requeueing per `always_requeue_on_tx_rollback` and the usual requeue
//! policy.

use async_trait::async_trait;

use crate::error::{ListenerError, TxError};

/// Factory for per-batch transactions.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Opens a transaction covering one batch.
    async fn begin(&self) -> Result<Box<dyn Transaction>, TxError>;
}

/// One in-flight transaction. Exactly one of `commit`/`rollback` is called.
#[async_trait]
pub trait Transaction: Send {
    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<(), TxError>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> Result<(), TxError>;
}

/// Decides which listener failures roll the external transaction back.
///
/// The predicate is a plain function value so attributes stay `Copy` and the
/// decision point is swappable without another trait.
#[derive(Clone, Copy)]
pub struct TxAttribute {
    /// Returns true when the error must roll the transaction back.
    pub rollback_on: fn(&ListenerError) -> bool,
}

impl TxAttribute {
    /// Rolls back on every listener failure (the default).
    pub fn rollback_on_all() -> Self {
        Self {
            rollback_on: |_| true,
        }
    }

    /// Never rolls back; failed batches are swallowed and committed.
    pub fn never_rollback() -> Self {
        Self {
            rollback_on: |_| false,
        }
    }
}

impl Default for TxAttribute {
    fn default() -> Self {
        Self::rollback_on_all()
    }
}
