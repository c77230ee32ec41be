use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::MIN_SLEEP_TIME;
use crate::core::shard::Shard;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};
use crate::executor::ExecutorPool;
use crate::storage::kvstore::FetchCtx;

/// Batching reader for non-resident documents, one per shard. Frontend
/// misses park their cookies on the vbucket's fetch queue and flag the
/// vbucket here; each run snapshots the flagged set, issues one getMulti
/// per vbucket and resumes the waiters.
pub struct BgFetcher {
    shard: Weak<Shard>,
    pending_vbs: Mutex<HashSet<u16>>,
    pending_fetch: AtomicBool,
    fetch_delay: Duration,
    wiring: Mutex<Option<(Weak<ExecutorPool>, Arc<TaskHandle>)>>,
}

impl BgFetcher {
    pub fn new(shard: Weak<Shard>, fetch_delay: Duration) -> Self {
        Self {
            shard,
            pending_vbs: Mutex::new(HashSet::new()),
            pending_fetch: AtomicBool::new(false),
            fetch_delay,
            wiring: Mutex::new(None),
        }
    }

    pub fn set_task(&self, pool: Weak<ExecutorPool>, handle: Arc<TaskHandle>) {
        *self.wiring.lock() = Some((pool, handle));
    }

    /// Flag `vb` as having outstanding fetch work and wake the task.
    pub fn notify_bg_event(&self, vb: u16) {
        self.pending_vbs.lock().insert(vb);
        self.pending_fetch.store(true, Ordering::Release);
        if let Some((pool, handle)) = self.wiring.lock().as_ref() {
            if let Some(pool) = pool.upgrade() {
                pool.wake(handle);
            }
        }
    }

    pub fn pending_vb_count(&self) -> usize {
        self.pending_vbs.lock().len()
    }

    /// One scheduler slice.
    pub fn step(&self, handle: &TaskHandle) -> bool {
        self.pending_fetch.store(false, Ordering::Release);

        let Some(shard) = self.shard.upgrade() else {
            return false;
        };

        let vbs: Vec<u16> = {
            let mut pending = self.pending_vbs.lock();
            pending.drain().collect()
        };

        for vbid in vbs {
            let Some(vb) = shard.get_vbucket(vbid) else {
                continue;
            };

            if vb.is_bucket_creation() {
                // file not created yet; try again next run
                self.pending_vbs.lock().insert(vbid);
                self.pending_fetch.store(true, Ordering::Release);
                continue;
            }

            let fetches = vb.take_bg_fetches();
            if fetches.is_empty() {
                continue;
            }

            let mut ctxs: HashMap<Vec<u8>, FetchCtx> = fetches
                .iter()
                .map(|(key, item)| (key.clone(), FetchCtx::new(item.meta_only)))
                .collect();

            let fetch_result = shard.store.lock().get_multi(vbid, &mut ctxs);
            match fetch_result {
                Ok(()) => {
                    for (key, entry) in fetches {
                        let fetched = ctxs.get_mut(&key).and_then(|ctx| ctx.item.take());
                        vb.complete_bg_fetch(&key, fetched, entry);
                    }
                }
                Err(e) => {
                    tracing::warn!(vb = vbid, error = %e, "background fetch failed, re-queueing");
                    vb.requeue_bg_fetches(fetches);
                    self.pending_vbs.lock().insert(vbid);
                    self.pending_fetch.store(true, Ordering::Release);
                }
            }
        }

        if self.pending_fetch.load(Ordering::Acquire) {
            handle.snooze(Duration::ZERO);
        } else {
            handle.snooze(self.fetch_delay.max(MIN_SLEEP_TIME));
        }
        true
    }
}

/// Scheduler wrapper so the shared fetcher can live on a Reader queue.
pub struct BgFetcherTask {
    pub fetcher: Arc<BgFetcher>,
    pub shard_id: usize,
}

impl GlobalTask for BgFetcherTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        self.fetcher.step(handle)
    }

    fn description(&self) -> String {
        format!("Batching background fetch: shard {}", self.shard_id)
    }

    fn task_type(&self) -> TaskType {
        TaskType::Reader
    }

    fn kind(&self) -> TaskKind {
        TaskKind::BgFetcher
    }

    fn priority(&self) -> u8 {
        0
    }
}
