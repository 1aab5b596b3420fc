//! Best-effort durable copy of the registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::error::PersistenceError;
use crate::models::VehicleRecord;

/// Durable store that mirrors registry contents for restart recovery
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Every stored record, used once at startup to seed the registry
    async fn load_all(&self) -> Result<Vec<VehicleRecord>, PersistenceError>;

    /// Store a record unless a newer one for the same id is already stored
    async fn upsert(&self, record: &VehicleRecord) -> Result<(), PersistenceError>;

    /// Delete one vehicle, returning whether a row existed
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Delete every record last updated strictly before `cutoff`
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError>;

    /// Delete everything
    async fn clear(&self) -> Result<u64, PersistenceError>;
}

/// Write queued for the mirror's writer task
enum MirrorOp {
    Upsert(VehicleRecord),
    Delete(String),
    DeleteBefore(DateTime<Utc>, oneshot::Sender<Option<u64>>),
    Clear(oneshot::Sender<Option<u64>>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Connected {
    mirror: Arc<dyn Mirror>,
    writer: mpsc::UnboundedSender<MirrorOp>,
}

/// Optional mirror plus the time bound applied to each call.
///
/// Writes go through a single queue drained by one writer task, so they
/// reach the store in the order they were issued. A delete or clear can
/// never be overtaken by an upsert issued before it. Every call is bounded
/// by `timeout` and failures are logged and swallowed, so a stalled or
/// missing store never reaches the caller.
#[derive(Clone)]
pub struct MirrorHandle {
    inner: Option<Connected>,
    timeout: Duration,
}

impl MirrorHandle {
    /// Wrap `mirror` and start its writer task. Must be called inside a
    /// tokio runtime.
    pub fn new(mirror: Arc<dyn Mirror>, timeout: Duration) -> Self {
        let (writer, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(mirror.clone(), timeout, queue));
        Self {
            inner: Some(Connected { mirror, writer }),
            timeout,
        }
    }

    /// A handle that does nothing
    pub fn disabled() -> Self {
        Self {
            inner: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Records to seed the registry with. Empty when disabled or unavailable.
    pub async fn load_all(&self) -> Vec<VehicleRecord> {
        let Some(connected) = &self.inner else {
            return Vec::new();
        };
        bounded(self.timeout, "load_all", connected.mirror.load_all())
            .await
            .unwrap_or_default()
    }

    /// Queue a record write
    pub fn queue_upsert(&self, record: VehicleRecord) {
        self.enqueue(MirrorOp::Upsert(record));
    }

    /// Queue a vehicle delete
    pub fn queue_delete(&self, id: String) {
        self.enqueue(MirrorOp::Delete(id));
    }

    /// Delete stale rows; `None` when disabled or the store failed
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Option<u64> {
        let (reply, done) = oneshot::channel();
        if !self.enqueue(MirrorOp::DeleteBefore(cutoff, reply)) {
            return None;
        }
        done.await.ok().flatten()
    }

    /// Delete everything, after every write queued before it
    pub async fn clear(&self) -> Option<u64> {
        let (reply, done) = oneshot::channel();
        if !self.enqueue(MirrorOp::Clear(reply)) {
            return None;
        }
        done.await.ok().flatten()
    }

    /// Wait until every write queued so far has been attempted
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        if self.enqueue(MirrorOp::Flush(reply)) {
            let _ = done.await;
        }
    }

    fn enqueue(&self, op: MirrorOp) -> bool {
        let Some(connected) = &self.inner else {
            return false;
        };
        if connected.writer.send(op).is_err() {
            tracing::warn!("Durable mirror writer has stopped, dropping write");
            return false;
        }
        true
    }
}

async fn write_loop(
    mirror: Arc<dyn Mirror>,
    timeout: Duration,
    mut queue: mpsc::UnboundedReceiver<MirrorOp>,
) {
    while let Some(op) = queue.recv().await {
        match op {
            MirrorOp::Upsert(record) => {
                bounded(timeout, "upsert", mirror.upsert(&record)).await;
            }
            MirrorOp::Delete(id) => {
                bounded(timeout, "delete", mirror.delete(&id)).await;
            }
            MirrorOp::DeleteBefore(cutoff, reply) => {
                let removed = bounded(timeout, "delete_before", mirror.delete_before(cutoff)).await;
                let _ = reply.send(removed);
            }
            MirrorOp::Clear(reply) => {
                let removed = bounded(timeout, "clear", mirror.clear()).await;
                let _ = reply.send(removed);
            }
            MirrorOp::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!("Durable mirror writer stopped");
}

async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T, PersistenceError>>,
) -> Option<T> {
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout {
            operation,
            after: timeout,
        }),
    };

    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                operation,
                error = %err,
                source = ?std::error::Error::source(&err),
                "Durable mirror call failed, continuing without it"
            );
            None
        }
    }
}
