mod error;
mod mutations;
mod queries;
mod store;

pub use error::{EngineError, GuardFailure};

use std::io;
use std::path::PathBuf;

use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use crate::limits::MAX_BATCH_STATEMENTS;
use crate::model::*;
use crate::wal::Wal;

use store::Tables;

/// Single-writer table store. Every write is a batch of [`Statement`]s that commits
/// as a whole or not at all; a committed batch is one WAL record.
pub struct Engine {
    tables: RwLock<Tables>,
    wal: Mutex<Wal>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut tables = Tables::default();
        let mut replayed = 0usize;
        for event in events {
            match event {
                Event::BatchCommitted { statements } => {
                    let mut undo = Vec::with_capacity(statements.len());
                    for stmt in &statements {
                        if let Err(guard) = tables.apply(stmt, &mut undo) {
                            // Only committed batches are logged, so this means the log
                            // and the code disagree; keep the rest of the history.
                            tracing::error!("replay: logged batch no longer applies ({guard}), skipping");
                            tables.rollback(std::mem::take(&mut undo));
                            break;
                        }
                    }
                }
                snapshot_row => tables.restore_row(snapshot_row),
            }
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!("replayed {replayed} WAL entries from {}", wal_path.display());
        }

        Ok(Self {
            tables: RwLock::new(tables),
            wal: Mutex::new(wal),
        })
    }

    /// Run `statements` as one atomic batch.
    ///
    /// Statements apply in order under the writer lock. The first conditional
    /// statement that matches no row rolls back everything before it and its
    /// [`GuardFailure`] is returned. On success the batch is fsynced to the WAL before
    /// the lock is released; a WAL failure also rolls the batch back.
    pub async fn execute(&self, statements: Vec<Statement>) -> Result<(), EngineError> {
        if statements.is_empty() {
            return Ok(());
        }
        if statements.len() > MAX_BATCH_STATEMENTS {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut tables = self.tables.write().await;
        let mut undo = Vec::with_capacity(statements.len() + 1);
        for stmt in &statements {
            if let Err(guard) = tables.apply(stmt, &mut undo) {
                tables.rollback(undo);
                metrics::counter!(crate::observability::BATCHES_TOTAL, "outcome" => "aborted").increment(1);
                return Err(EngineError::Guard(guard));
            }
        }

        let event = Event::BatchCommitted { statements };
        if let Err(e) = self.wal_append(&event).await {
            tables.rollback(undo);
            metrics::counter!(crate::observability::BATCHES_TOTAL, "outcome" => "wal_error").increment(1);
            return Err(e);
        }
        metrics::counter!(crate::observability::BATCHES_TOTAL, "outcome" => "committed").increment(1);
        Ok(())
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let mut wal = self.wal.lock().await;
        let flush_start = std::time::Instant::now();
        let result = wal.append(event);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        result.map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Rewrite the WAL as a snapshot of the current rows. Holds the read lock for
    /// the duration, so no batch can commit between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let tables = self.tables.read().await;
        let events = tables.snapshot();
        let mut wal = self.wal.lock().await;
        wal.compact(&events)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {} entries", events.len());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.lock().await.appends_since_compact()
    }
}
