use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::checkpoint::PERSISTENCE_CURSOR;
use crate::core::item::Item;
use crate::core::shard::Shard;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};
use crate::executor::ExecutorPool;
use crate::stats::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlusherState {
    Initializing = 0,
    Running = 1,
    Snoozed = 2,
    Pausing = 3,
    Paused = 4,
    Stopping = 5,
    Stopped = 6,
}

fn flusher_state_from_u8(v: u8) -> FlusherState {
    match v {
        0 => FlusherState::Initializing,
        1 => FlusherState::Running,
        2 => FlusherState::Snoozed,
        3 => FlusherState::Pausing,
        4 => FlusherState::Paused,
        5 => FlusherState::Stopping,
        _ => FlusherState::Stopped,
    }
}

const IDLE_SLEEP: Duration = Duration::from_millis(250);
const PAUSED_SLEEP: Duration = Duration::from_secs(3600);

/// Batching writer to the KV store, one per shard. Iterates the shard's
/// vbuckets round-robin, draining each persistence cursor into a batch
/// that commits as one transaction; a failed commit parks the batch on a
/// per-vbucket reject queue retried ahead of new work.
pub struct Flusher {
    shard: Weak<Shard>,
    state: AtomicU8,
    batch_cap: usize,
    reject: Mutex<HashMap<u16, Vec<Item>>>,
    wiring: Mutex<Option<(Weak<ExecutorPool>, Arc<TaskHandle>)>>,
    stats: Arc<Statistics>,
}

impl Flusher {
    pub fn new(shard: Weak<Shard>, stats: Arc<Statistics>, batch_cap: usize) -> Self {
        Self {
            shard,
            state: AtomicU8::new(FlusherState::Initializing as u8),
            batch_cap: batch_cap.max(1),
            reject: Mutex::new(HashMap::new()),
            wiring: Mutex::new(None),
            stats,
        }
    }

    pub fn state(&self) -> FlusherState {
        flusher_state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FlusherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, to: FlusherState, from: FlusherState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attach the scheduled task so mutations can wake the flusher.
    pub fn set_task(&self, pool: Weak<ExecutorPool>, handle: Arc<TaskHandle>) {
        *self.wiring.lock() = Some((pool, handle));
    }

    /// Nudge the flusher; called after every accepted mutation.
    pub fn notify(&self) {
        if let Some((pool, handle)) = self.wiring.lock().as_ref() {
            if let Some(pool) = pool.upgrade() {
                pool.wake(handle);
            }
        }
    }

    /// STOP_PERSISTENCE: mutations keep accumulating, no disk writes.
    pub fn pause(&self) {
        if self.transition(FlusherState::Pausing, FlusherState::Running)
            || self.transition(FlusherState::Pausing, FlusherState::Snoozed)
            || self.transition(FlusherState::Pausing, FlusherState::Initializing)
        {
            tracing::info!("flusher pausing");
        }
    }

    /// START_PERSISTENCE.
    pub fn resume(&self) {
        let state = self.state();
        if matches!(
            state,
            FlusherState::Paused | FlusherState::Pausing
        ) {
            self.set_state(FlusherState::Running);
            tracing::info!("flusher resumed");
            self.notify();
        }
    }

    pub fn stop(&self) {
        self.set_state(FlusherState::Stopping);
        self.notify();
    }

    /// One scheduler slice. Returns false once fully stopped.
    pub fn step(&self, handle: &TaskHandle) -> bool {
        match self.state() {
            FlusherState::Initializing => {
                self.set_state(FlusherState::Running);
                handle.snooze(Duration::ZERO);
                true
            }
            FlusherState::Pausing => {
                self.set_state(FlusherState::Paused);
                handle.snooze(PAUSED_SLEEP);
                true
            }
            FlusherState::Paused => {
                handle.snooze(PAUSED_SLEEP);
                true
            }
            FlusherState::Stopping => {
                tracing::info!("flusher stopped");
                self.set_state(FlusherState::Stopped);
                false
            }
            FlusherState::Stopped => false,
            FlusherState::Running | FlusherState::Snoozed => {
                self.set_state(FlusherState::Running);
                let flushed = self.flush_all();
                if flushed == 0 {
                    self.set_state(FlusherState::Snoozed);
                    handle.snooze(IDLE_SLEEP);
                } else {
                    handle.snooze(Duration::ZERO);
                }
                true
            }
        }
    }

    /// Round-robin over the shard's vbuckets; returns items written.
    /// Also the synchronous flush entry point for shutdown and tests.
    pub fn flush_all(&self) -> usize {
        let Some(shard) = self.shard.upgrade() else {
            return 0;
        };
        let mut flushed = 0;
        for vbid in shard.vbucket_ids() {
            flushed += self.flush_vbucket(&shard, vbid);
        }
        flushed
    }

    fn flush_vbucket(&self, shard: &Arc<Shard>, vbid: u16) -> usize {
        let Some(vb) = shard.get_vbucket(vbid) else {
            return 0;
        };

        // rejected items retry ahead of newly drained work
        let mut batch: Vec<Item> = self.reject.lock().remove(&vbid).unwrap_or_default();

        let remaining_cap = self.batch_cap.saturating_sub(batch.len());
        let drain = vb
            .checkpoints
            .drain_cursor(PERSISTENCE_CURSOR, remaining_cap);
        let (snap_start, snap_end) = match &drain {
            Some(d) => (d.snap_start, d.snap_end),
            None => (0, 0),
        };
        if let Some(d) = drain {
            batch.extend(d.items.into_iter().filter_map(|e| e.item));
        }
        if batch.is_empty() {
            return 0;
        }

        // duplicate keys within a batch keep only the latest revision
        let mut latest: HashMap<Vec<u8>, Item> = HashMap::with_capacity(batch.len());
        for item in batch.drain(..) {
            latest.insert(item.key.clone(), item);
        }
        let mut batch: Vec<Item> = latest.into_values().collect();
        batch.sort_by_key(|i| i.by_seqno);

        self.stats
            .flusher_todo
            .store(batch.len(), Ordering::Release);

        let commit_result = {
            let mut store = shard.store.lock();
            let result = (|| {
                store.begin()?;
                for item in &batch {
                    if item.deleted {
                        store.del(vbid, &item.key, item.by_seqno, &item.meta)?;
                    } else {
                        store.set(vbid, item)?;
                    }
                }
                store.snapshot_vbucket(vbid, &vb.state_record())?;
                store.commit()
            })();
            if result.is_err() {
                let _ = store.rollback();
            }
            result
        };
        self.stats.flusher_todo.store(0, Ordering::Release);

        match commit_result {
            Ok(()) => {
                let count = batch.len();
                vb.on_persisted(&batch, snap_start, snap_end);
                vb.mark_file_created();
                self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(e) => {
                tracing::error!(vb = vbid, error = %e, "commit failed, batch will retry");
                self.stats
                    .item_commit_failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.reject.lock().insert(vbid, batch);
                0
            }
        }
    }

    /// Items parked for retry after a failed commit.
    pub fn reject_queue_len(&self) -> usize {
        self.reject.lock().values().map(Vec::len).sum()
    }
}

/// Scheduler wrapper so the shared flusher can live on a Writer queue.
pub struct FlusherTask {
    pub flusher: Arc<Flusher>,
    pub shard_id: usize,
}

impl GlobalTask for FlusherTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        self.flusher.step(handle)
    }

    fn description(&self) -> String {
        format!("Running a flusher loop: shard {}", self.shard_id)
    }

    fn task_type(&self) -> TaskType {
        TaskType::Writer
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Flusher
    }

    fn priority(&self) -> u8 {
        0
    }
}
