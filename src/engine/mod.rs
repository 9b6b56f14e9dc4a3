mod bookings;
mod compose;
mod conflict;
mod error;
mod payments;
mod pricing;
mod queries;
mod repo;

pub use conflict::{conflicts, find_conflict, Occupancy};
pub use error::{EngineError, Entity, ErrorKind};
pub use payments::{settle, Settlement, Terms};
pub use pricing::nightly_total;
pub use repo::{IsolationLevel, ListingRepo, ReservationRepo, Store, Transaction, Transactor};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The reservation engine: booking lifecycle, payment state machine and the
/// compose operations, written against any [`Store`].
pub struct Engine<S> {
    store: Arc<S>,
    op_timeout: Option<Duration>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            op_timeout: self.op_timeout,
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            op_timeout: None,
        }
    }

    /// Deadline applied to every operation. Work that runs past it is
    /// dropped, rolling back its transaction, and fails with `Cancelled`.
    /// A commit that has started is never cut short.
    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(EngineError::Cancelled { op })),
            None => fut.await,
        }
    }

    async fn record<T, F>(&self, op: &'static str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => error_label(e.kind()),
        };
        metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        result
    }

    /// Run one write operation. `work` opens a transaction and hands it back
    /// with its outcome; the deadline covers only that part. The commit runs
    /// outside it, so `Cancelled` always means nothing was written.
    async fn transact<T, F>(&self, op: &'static str, work: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<(S::Tx, Result<T, EngineError>), EngineError>>,
    {
        self.record(op, async {
            let (tx, result) = self.deadline(op, work).await?;
            finish(tx, result).await
        })
        .await
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::Validation => "validation",
        ErrorKind::Conflict => "conflict",
        ErrorKind::Internal => "internal",
        ErrorKind::Cancelled => "cancelled",
    }
}

/// Commit on success, roll back on failure.
async fn finish<T, X: Transaction>(
    tx: X,
    result: Result<T, EngineError>,
) -> Result<T, EngineError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}
