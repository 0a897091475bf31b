//! Sync dispatcher: decides when committed index mutations reach the flat
//! files.
//!
//! * [`SyncStrategy::Immediate`] persists inside the mutating call.
//! * [`SyncStrategy::OnClose`] queues until an explicit flush (detach).
//! * [`SyncStrategy::Batch`] queues and flushes when the queue reaches
//!   `batch_size`, or when the [`FlushTimer`] fires.
//!
//! Queued writes are retried in full order after a failed flush; the
//! executed prefix is dropped from the queue before the error is returned,
//! so nothing that already reached disk is replayed.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{SyncConfig, SyncStrategy};
use crate::error::StoreResult;
use crate::mirror::{Collection, Mirror};
use crate::tables::{StashHistoryEntry, TableName};

// ═══════════════════════════════════════════════════════════════════════
//  Pending writes
// ═══════════════════════════════════════════════════════════════════════

/// The mutation that produced a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One unit of flat-file work.
#[derive(Debug, Clone)]
pub(crate) enum PersistAction {
    /// Dump the whole table over its file. Idempotent.
    Rewrite(Collection),
    /// Append entries to the history log, skipping any already present.
    AppendHistory(Vec<StashHistoryEntry>),
}

/// Everything one committed mutation needs persisted.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub table: TableName,
    pub operation: Operation,
    actions: VecDeque<PersistAction>,
}

impl PendingWrite {
    pub fn new(table: TableName, operation: Operation, actions: Vec<PersistAction>) -> Self {
        Self {
            table,
            operation,
            actions: actions.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SyncDispatcher
// ═══════════════════════════════════════════════════════════════════════

/// Owns the pending-write queue and the active strategy.
pub struct SyncDispatcher {
    strategy: SyncStrategy,
    batch_size: usize,
    mirror: Mirror,
    /// Also serializes immediate-mode writers so an older dump never lands
    /// after a newer one.
    queue: Mutex<VecDeque<PendingWrite>>,
}

impl SyncDispatcher {
    pub(crate) fn new(config: &SyncConfig, mirror: Mirror) -> Self {
        Self {
            strategy: config.strategy,
            batch_size: config.batch_size,
            mirror,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Number of queued writes not yet flushed.
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Persist or queue a committed mutation according to the strategy.
    pub(crate) async fn persist(&self, write: PendingWrite) -> StoreResult<()> {
        let mut queue = self.queue.lock().await;
        debug!(
            table = %write.table,
            operation = %write.operation,
            strategy = %self.strategy,
            "persist requested"
        );

        match self.strategy {
            SyncStrategy::Immediate => {
                queue.push_back(write);
                self.drain(&mut queue).await
            }
            SyncStrategy::OnClose => {
                queue.push_back(write);
                Ok(())
            }
            SyncStrategy::Batch => {
                queue.push_back(write);
                if self.batch_size > 0 && queue.len() >= self.batch_size {
                    debug!(queued = queue.len(), "batch size reached, flushing");
                    self.drain(&mut queue).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Execute every queued write in order.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return Ok(());
        }
        let queued = queue.len();
        self.drain(&mut queue).await?;
        debug!(writes = queued, "flush complete");
        Ok(())
    }

    /// Run queued actions front to back, popping each one only after it
    /// succeeds. A collection already rewritten in this pass is skipped:
    /// the dump reads the committed table, so a second one would write the
    /// same content.
    async fn drain(&self, queue: &mut VecDeque<PendingWrite>) -> StoreResult<()> {
        let mut rewritten: HashSet<Collection> = HashSet::new();

        while let Some(write) = queue.front_mut() {
            while let Some(action) = write.actions.front() {
                match action {
                    PersistAction::Rewrite(collection) => {
                        if rewritten.insert(*collection) {
                            self.mirror.rewrite(*collection).await?;
                        }
                    }
                    PersistAction::AppendHistory(entries) => {
                        self.mirror.append_history(entries.clone()).await?;
                    }
                }
                write.actions.pop_front();
            }
            queue.pop_front();
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  FlushTimer
// ═══════════════════════════════════════════════════════════════════════

/// Background task that flushes the dispatcher every `period`.
pub(crate) struct FlushTimer {
    live: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTimer {
    pub fn start(sync: Arc<SyncDispatcher>, period: Duration) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let task_live = Arc::clone(&live);
        let task_shutdown = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "flush timer started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_shutdown.notified() => break,
                    _ = ticker.tick() => {}
                }
                if !task_live.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sync.flush().await {
                    warn!(error = %e, "timer flush failed; writes stay queued");
                }
            }

            info!("flush timer stopped");
        });

        Self {
            live,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the timer and wait for the task, including a tick already in
    /// progress. No flush starts after this returns.
    pub async fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "flush timer panicked during shutdown");
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::jsonl;
    use crate::tables::{Trail, trail};

    async fn setup(config: SyncConfig) -> (tempfile::TempDir, Database, Arc<SyncDispatcher>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let mirror = Mirror::new(db.clone(), dir.path().to_path_buf());
        mirror.ensure_files().await.unwrap();
        let sync = Arc::new(SyncDispatcher::new(&config, mirror));
        (dir, db, sync)
    }

    async fn insert_trail(db: &Database) {
        let trail = Trail::new();
        db.execute(move |conn| trail::restore(conn, &[trail]).map(|_| ()))
            .await
            .unwrap();
    }

    fn trail_write() -> PendingWrite {
        PendingWrite::new(
            TableName::Trails,
            Operation::Set,
            vec![PersistAction::Rewrite(Collection::Trails)],
        )
    }

    fn trails_on_disk(dir: &tempfile::TempDir) -> usize {
        jsonl::read_all::<Trail>(&dir.path().join("trails.jsonl"))
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn immediate_writes_before_returning() {
        let (dir, db, sync) = setup(SyncConfig::immediate()).await;
        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        assert_eq!(trails_on_disk(&dir), 1);
        assert_eq!(sync.pending().await, 0);
    }

    #[tokio::test]
    async fn on_close_waits_for_flush() {
        let (dir, db, sync) = setup(SyncConfig::on_close()).await;
        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        assert_eq!(trails_on_disk(&dir), 0);
        assert_eq!(sync.pending().await, 1);

        sync.flush().await.unwrap();
        assert_eq!(trails_on_disk(&dir), 1);
        assert_eq!(sync.pending().await, 0);
    }

    #[tokio::test]
    async fn batch_flushes_at_threshold() {
        let (dir, db, sync) = setup(SyncConfig::batch(3, 0)).await;
        for _ in 0..2 {
            insert_trail(&db).await;
            sync.persist(trail_write()).await.unwrap();
        }
        assert_eq!(trails_on_disk(&dir), 0);

        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        assert_eq!(trails_on_disk(&dir), 3);
        assert_eq!(sync.pending().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_unexecuted_remainder() {
        let (dir, db, sync) = setup(SyncConfig::on_close()).await;
        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        sync.persist(PendingWrite::new(
            TableName::Links,
            Operation::Set,
            vec![PersistAction::Rewrite(Collection::Links)],
        ))
        .await
        .unwrap();

        // A directory where the links file should be makes its rewrite fail.
        let links = dir.path().join("links.jsonl");
        std::fs::remove_file(&links).unwrap();
        std::fs::create_dir(&links).unwrap();

        assert!(sync.flush().await.is_err());
        assert_eq!(trails_on_disk(&dir), 1);
        assert_eq!(sync.pending().await, 1);

        std::fs::remove_dir(&links).unwrap();
        sync.flush().await.unwrap();
        assert_eq!(sync.pending().await, 0);
        assert!(links.is_file());
    }

    #[tokio::test]
    async fn timer_flushes_and_stops() {
        let (dir, db, sync) = setup(SyncConfig::batch(0, 1)).await;
        let mut timer = FlushTimer::start(Arc::clone(&sync), Duration::from_millis(50));

        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(trails_on_disk(&dir), 1);

        timer.stop().await;
        insert_trail(&db).await;
        sync.persist(trail_write()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(trails_on_disk(&dir), 1);
        assert_eq!(sync.pending().await, 1);
    }
}
