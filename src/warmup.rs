use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::core::hash_table::EvictionPolicy;
use crate::core::store::EmberStore;
use crate::core::vbucket::{VBucket, VBucketSeeds, VBucketState};
use crate::error::Result;
use crate::storage::kvstore::{ScanControl, ValueFilter};
use crate::tasks::access_scanner::{read_access_log, shard_log_path};

/// Phases of the startup state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupState {
    Initialize,
    CreateVBuckets,
    EstimateItemCount,
    KeyDump,
    CheckAccessLog,
    LoadAccessLog,
    LoadPreparedSyncWrites,
    PopulateVBucketMap,
    LoadingData,
    Done,
}

/// Rebuilds the memory image from disk at startup. Runs synchronously
/// inside `EmberStore::open`, stepping through each phase; nothing
/// observes a half-warmed store.
pub struct Warmup {
    state: WarmupState,
    started: Instant,
    estimated_items: u64,
    created: Vec<Arc<VBucket>>,
    access_log_found: bool,
    oom: bool,
}

impl Warmup {
    pub fn new() -> Self {
        Self {
            state: WarmupState::Initialize,
            started: Instant::now(),
            estimated_items: 0,
            created: Vec::new(),
            access_log_found: false,
            oom: false,
        }
    }

    pub fn state(&self) -> WarmupState {
        self.state
    }

    pub fn hit_oom(&self) -> bool {
        self.oom
    }

    fn advance(&mut self, next: WarmupState) {
        tracing::info!(from = ?self.state, to = ?next, "warmup transition");
        self.state = next;
    }

    /// Drive the machine to `Done`. Returns the vbuckets restored.
    pub fn run(&mut self, store: &Arc<EmberStore>) -> Result<usize> {
        self.advance(WarmupState::CreateVBuckets);
        self.create_vbuckets(store)?;

        self.advance(WarmupState::EstimateItemCount);
        self.estimate_item_count(store)?;

        self.advance(WarmupState::KeyDump);
        self.key_dump(store)?;

        self.advance(WarmupState::CheckAccessLog);
        self.check_access_log(store);

        self.advance(WarmupState::LoadAccessLog);
        self.load_access_log(store)?;

        self.advance(WarmupState::LoadPreparedSyncWrites);

        self.advance(WarmupState::PopulateVBucketMap);
        self.populate_vbucket_map(store);

        self.advance(WarmupState::LoadingData);
        self.loading_data(store)?;

        self.advance(WarmupState::Done);
        self.finish(store);
        Ok(self.created.len())
    }

    /// Open every persisted vbucket file and recreate the VBucket in its
    /// recorded state; a legacy file without a state record synthesizes a
    /// fresh lineage.
    fn create_vbuckets(&mut self, store: &Arc<EmberStore>) -> Result<()> {
        for shard in store.shards() {
            let persisted = shard.store.lock().list_persisted_vbuckets()?;
            for (vbid, record) in persisted {
                let high_seqno = shard.store.lock().high_seqno(vbid)?;
                let failover = if record.failover_table.is_empty() {
                    None // synthesized by VBucket::new
                } else {
                    Some(crate::core::failover::FailoverTable::from_entries(
                        record.failover_table.clone(),
                    ))
                };
                let seeds = VBucketSeeds {
                    high_seqno,
                    purge_seqno: 0,
                    max_deleted_rev: record.max_deleted_seqno,
                    max_cas: record.max_cas,
                    failover,
                    num_total_items: 0,
                };
                let vb = Arc::new(VBucket::new(
                    vbid,
                    record.state,
                    store.vbucket_options(),
                    seeds,
                    store.notifier(),
                    store.stats().clone(),
                ));
                vb.mark_file_created();
                vb.seed_persisted(high_seqno, record.snap_start, record.snap_end.max(high_seqno));
                self.created.push(vb);
            }
        }
        tracing::info!(vbuckets = self.created.len(), "warmup created vbuckets");
        Ok(())
    }

    fn estimate_item_count(&mut self, store: &Arc<EmberStore>) -> Result<()> {
        for vb in &self.created {
            let shard = store.shard_for(vb.id);
            let count = shard.store.lock().get_item_count(vb.id)?;
            vb.ht
                .counters
                .num_total_items
                .store(count, Ordering::Release);
            self.estimated_items += count as u64;
        }
        tracing::info!(estimated = self.estimated_items, "warmup estimated item count");
        Ok(())
    }

    /// Value eviction loads every key's metadata; full eviction only
    /// seeds the bloom filter from the on-disk key set.
    fn key_dump(&mut self, store: &Arc<EmberStore>) -> Result<()> {
        let full_eviction = store.eviction_policy() == EvictionPolicy::FullEviction;
        for vb in &self.created {
            let shard = store.shard_for(vb.id);
            let guard = shard.store.lock();
            guard.scan(
                vb.id,
                0,
                u64::MAX,
                ValueFilter::KeysOnly,
                &mut |item| {
                    vb.warm_bloom_key(&item.key);
                    if !full_eviction && !item.deleted {
                        if vb.warm_insert(&item, false) {
                            store
                                .stats()
                                .warmup_item_count
                                .fetch_add(1, Ordering::Relaxed);
                        } else {
                            store.stats().warmup_dups.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    ScanControl::Continue
                },
            )?;
        }
        Ok(())
    }

    fn check_access_log(&mut self, store: &Arc<EmberStore>) {
        self.access_log_found = store
            .shards()
            .iter()
            .any(|shard| shard_log_path(store.data_dir(), shard.id).exists());
    }

    /// Load the documents a previous access scan saw referenced, ahead of
    /// the sequential data load.
    fn load_access_log(&mut self, store: &Arc<EmberStore>) -> Result<()> {
        if !self.access_log_found {
            return Ok(());
        }
        let created = self.created.clone();
        for shard in store.shards() {
            let path = shard_log_path(store.data_dir(), shard.id);
            if !path.exists() {
                continue;
            }
            let entries = match read_access_log(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(shard = shard.id, error = %e, "unreadable access log");
                    continue;
                }
            };
            for (vbid, key) in entries {
                if self.over_thresholds(store) {
                    return Ok(());
                }
                let Some(vb) = created.iter().find(|vb| vb.id == vbid) else {
                    continue;
                };
                let fetched = shard.store.lock().get(vbid, &key)?;
                if let Some(item) = fetched {
                    if !item.deleted && self.load_one(store, vb, &item) {
                        return Ok(()); // OOM
                    }
                }
            }
        }
        Ok(())
    }

    fn populate_vbucket_map(&mut self, store: &Arc<EmberStore>) {
        for vb in &self.created {
            store.shard_for(vb.id).set_vbucket(vb.clone());
        }
    }

    /// Sequentially load values until the item or memory threshold is
    /// reached; OOM flips the bucket into degraded mode.
    fn loading_data(&mut self, store: &Arc<EmberStore>) -> Result<()> {
        let created = self.created.clone();
        for vb in &created {
            if self.oom || self.over_thresholds(store) {
                break;
            }
            let shard = store.shard_for(vb.id);
            let guard = shard.store.lock();
            let mut stop = false;
            guard.scan(vb.id, 0, u64::MAX, ValueFilter::Values, &mut |item| {
                if item.deleted {
                    return ScanControl::Continue;
                }
                if self.over_thresholds(store) || self.load_one(store, vb, &item) {
                    stop = true;
                    return ScanControl::Stop;
                }
                ScanControl::Continue
            })?;
            if stop && self.oom {
                break;
            }
        }
        Ok(())
    }

    /// Returns true when loading must stop because memory ran out.
    fn load_one(&mut self, store: &Arc<EmberStore>, vb: &Arc<VBucket>, item: &crate::core::item::Item) -> bool {
        if store.stats().mem_used() + item.size() > store.max_size() {
            if !self.oom {
                tracing::warn!("warmup out of memory, entering degraded mode");
                store.stats().warmup_oom.fetch_add(1, Ordering::Relaxed);
            }
            self.oom = true;
            return true;
        }
        if vb.warm_insert(item, true) {
            store
                .stats()
                .warmup_value_count
                .fetch_add(1, Ordering::Relaxed);
        } else {
            store.stats().warmup_dups.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    fn over_thresholds(&self, store: &Arc<EmberStore>) -> bool {
        let loaded = store.stats().warmup_value_count.load(Ordering::Relaxed);
        let item_target =
            self.estimated_items * store.warmup_min_items_threshold() as u64 / 100;
        if self.estimated_items > 0 && loaded >= item_target && item_target > 0 {
            return true;
        }
        let memory_target = store.max_size() * store.warmup_min_memory_threshold() / 100;
        store.stats().mem_used() >= memory_target
    }

    /// A restart is a lineage break: every restored active vbucket gets a
    /// fresh failover entry so reconnecting clients detect the crash.
    fn finish(&mut self, store: &Arc<EmberStore>) {
        for vb in &self.created {
            if vb.state() == VBucketState::Active {
                vb.new_failover_entry();
            }
        }
        let elapsed = self.started.elapsed();
        store
            .stats()
            .warmup_time_ns
            .store(elapsed.as_nanos() as u64, Ordering::Release);
        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            keys = store.stats().warmup_item_count.load(Ordering::Relaxed),
            values = store.stats().warmup_value_count.load(Ordering::Relaxed),
            oom = self.oom,
            "warmup done"
        );
    }
}

impl Default for Warmup {
    fn default() -> Self {
        Self::new()
    }
}
