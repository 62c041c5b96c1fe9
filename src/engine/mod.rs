mod diff;
mod error;
mod guard;
mod mutations;
mod queries;
mod store;

pub use diff::{apply_update, instant_changed, profiles_changed, text_changed, UpdateOutcome, INSTANT_TOLERANCE_MS};
pub use error::EngineError;
pub use guard::{ensure_profiles_exist, ensure_unique_name};
pub use store::{InMemoryStore, SharedEvent};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::model::*;
use crate::wal::Wal;

use store::apply_event_update;

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    record: Record,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Drain everything else already queued.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => tracing::debug!("WAL flushed {} records ({} this session)", batch.len(), wal.appends()),
            Err(e) => tracing::error!("WAL flush failed for batch of {}: {e}", batch.len()),
        }
        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|append| wal.append_buffered(&append.record))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every sender in the batch sees the error, so none of its frames may replay.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }
    result
}

/// One isolated store of profiles and events, persisted to its own WAL.
pub struct Engine {
    pub store: InMemoryStore,
    wal_tx: mpsc::Sender<WalAppend>,
    /// Serialises profile writes and event creation, so the name index and
    /// id checks cannot race. Event updates only take the event's own lock.
    catalog_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, records) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            catalog_lock: Mutex::new(()),
        };

        // Nothing else holds these locks yet, so try_write never fails here.
        // blocking_write would panic when this runs inside the runtime.
        for record in &records {
            match record {
                Record::EventUpdated { id, .. } => {
                    if let Some(event) = engine.store.find_event(id)
                        && let Ok(mut guard) = event.try_write()
                    {
                        apply_event_update(&mut guard, record);
                    }
                }
                other => engine.store.apply_record(other),
            }
        }

        tracing::debug!(
            "replayed {} records from {}: {} profiles, {} events",
            records.len(),
            wal_path.display(),
            engine.store.profile_count(),
            engine.store.event_count()
        );

        Ok(engine)
    }

    /// Write a record through the background group-commit writer and wait
    /// until it is durable.
    async fn wal_append(&self, record: &Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
