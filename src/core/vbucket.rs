use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BFILTER_FP_PROB, DEFAULT_BFILTER_KEY_COUNT, DEFAULT_CHECKPOINT_MAX_ITEMS,
    DEFAULT_GETL_MAX_TIMEOUT, DEFAULT_GETL_TIMEOUT, DEFAULT_HLC_DRIFT_AHEAD_US,
    DEFAULT_HLC_DRIFT_BEHIND_US, DEFAULT_HT_LOCKS, DEFAULT_HT_SIZE, LOCKED_CAS,
};
use crate::core::bloom::BloomFilter;
use crate::core::checkpoint::CheckpointManager;
use crate::core::failover::FailoverTable;
use crate::core::hash_table::{EvictionPolicy, HashTable};
use crate::core::hlc::HybridClock;
use crate::core::item::{Item, ItemMeta};
use crate::core::notifier::{Cookie, EngineNotifier, NotifyStatus};
use crate::core::stored_value::StoredValue;
use crate::error::{EmberError, Result};
use crate::stats::{sub_guarded, Statistics};
use crate::storage::kvstore::VbStateRecord;
use crate::utils::time::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl std::fmt::Display for VBucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Which path observed an expired document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirySource {
    Access,
    Pager,
    Compactor,
}

/// Outstanding background fetch for one key.
#[derive(Debug)]
pub struct BgFetchItem {
    pub cookies: Vec<Cookie>,
    pub meta_only: bool,
    pub start: Instant,
}

/// Outcome of a `set_with_meta`/`del_with_meta` after conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithMetaOutcome {
    Stored { cas: u64 },
    /// The local revision won; nothing changed.
    Skipped,
}

/// Construction parameters derived from the engine configuration.
#[derive(Debug, Clone)]
pub struct VBucketOptions {
    pub ht_size: usize,
    pub ht_locks: usize,
    pub eviction_policy: EvictionPolicy,
    pub checkpoint_max_items: usize,
    pub bfilter_enabled: bool,
    pub bfilter_fp_prob: f64,
    pub bfilter_key_count: usize,
    pub getl_default_timeout: Duration,
    pub getl_max_timeout: Duration,
    pub hlc_drift_ahead_us: u64,
    pub hlc_drift_behind_us: u64,
}

impl Default for VBucketOptions {
    fn default() -> Self {
        Self {
            ht_size: DEFAULT_HT_SIZE,
            ht_locks: DEFAULT_HT_LOCKS,
            eviction_policy: EvictionPolicy::ValueOnly,
            checkpoint_max_items: DEFAULT_CHECKPOINT_MAX_ITEMS,
            bfilter_enabled: true,
            bfilter_fp_prob: DEFAULT_BFILTER_FP_PROB,
            bfilter_key_count: DEFAULT_BFILTER_KEY_COUNT,
            getl_default_timeout: DEFAULT_GETL_TIMEOUT,
            getl_max_timeout: DEFAULT_GETL_MAX_TIMEOUT,
            hlc_drift_ahead_us: DEFAULT_HLC_DRIFT_AHEAD_US,
            hlc_drift_behind_us: DEFAULT_HLC_DRIFT_BEHIND_US,
        }
    }
}

/// Persisted values a restored vbucket starts from.
#[derive(Debug, Clone, Default)]
pub struct VBucketSeeds {
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub max_deleted_rev: u64,
    pub max_cas: u64,
    pub failover: Option<FailoverTable>,
    pub num_total_items: usize,
}

/// The unit of ownership, ordering, checkpointing and failover.
pub struct VBucket {
    pub id: u16,
    state: RwLock<VBucketState>,
    pub ht: HashTable,
    pub checkpoints: CheckpointManager,
    pub hlc: HybridClock,
    bloom: Mutex<Option<BloomFilter>>,
    failover: Mutex<FailoverTable>,
    high_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    last_persisted_seqno: AtomicU64,
    last_persisted_snap_start: AtomicU64,
    last_persisted_snap_end: AtomicU64,
    max_deleted_rev: AtomicU64,
    bg_queue: Mutex<HashMap<Vec<u8>, BgFetchItem>>,
    pending_ops: Mutex<Vec<Cookie>>,
    /// The on-disk file has not been created yet; background fetches for
    /// this vbucket are re-queued until the first flush.
    bucket_creation: AtomicBool,
    pub num_expired: AtomicU64,
    opts: VBucketOptions,
    notifier: Arc<dyn EngineNotifier>,
    stats: Arc<Statistics>,
}

enum ReadOutcome {
    Hit(Item),
    Miss,
    Expired,
    FetchValue,
    FetchFull,
    WaitExisting,
}

impl VBucket {
    pub fn new(
        id: u16,
        initial_state: VBucketState,
        opts: VBucketOptions,
        seeds: VBucketSeeds,
        notifier: Arc<dyn EngineNotifier>,
        stats: Arc<Statistics>,
    ) -> Self {
        let ht = HashTable::new(
            opts.ht_size,
            opts.ht_locks,
            opts.eviction_policy,
            stats.clone(),
        );
        ht.counters
            .num_total_items
            .store(seeds.num_total_items, Ordering::Release);

        let bloom = if opts.bfilter_enabled {
            Some(BloomFilter::new(opts.bfilter_key_count, opts.bfilter_fp_prob))
        } else {
            None
        };

        let failover = seeds
            .failover
            .unwrap_or_else(|| FailoverTable::new(seeds.high_seqno));

        Self {
            id,
            state: RwLock::new(initial_state),
            ht,
            checkpoints: CheckpointManager::new(
                seeds.high_seqno,
                opts.checkpoint_max_items,
                stats.clone(),
            ),
            hlc: HybridClock::new(
                seeds.max_cas,
                opts.hlc_drift_ahead_us,
                opts.hlc_drift_behind_us,
            ),
            bloom: Mutex::new(bloom),
            failover: Mutex::new(failover),
            high_seqno: AtomicU64::new(seeds.high_seqno),
            purge_seqno: AtomicU64::new(seeds.purge_seqno),
            last_persisted_seqno: AtomicU64::new(0),
            last_persisted_snap_start: AtomicU64::new(0),
            last_persisted_snap_end: AtomicU64::new(0),
            max_deleted_rev: AtomicU64::new(seeds.max_deleted_rev),
            bg_queue: Mutex::new(HashMap::new()),
            pending_ops: Mutex::new(Vec::new()),
            bucket_creation: AtomicBool::new(true),
            num_expired: AtomicU64::new(0),
            opts,
            notifier,
            stats,
        }
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn high_seqno(&self) -> u64 {
        self.high_seqno.load(Ordering::Acquire)
    }

    pub fn purge_seqno(&self) -> u64 {
        self.purge_seqno.load(Ordering::Acquire)
    }

    pub fn last_persisted_seqno(&self) -> u64 {
        self.last_persisted_seqno.load(Ordering::Acquire)
    }

    pub fn current_uuid(&self) -> u64 {
        self.failover.lock().current_uuid()
    }

    pub fn failover_entries(&self) -> Vec<crate::core::failover::FailoverEntry> {
        self.failover.lock().entries().to_vec()
    }

    pub fn is_bucket_creation(&self) -> bool {
        self.bucket_creation.load(Ordering::Acquire)
    }

    pub fn mark_file_created(&self) {
        self.bucket_creation.store(false, Ordering::Release);
    }

    pub fn bg_queue_len(&self) -> usize {
        self.bg_queue.lock().len()
    }

    /// Every data operation starts here; a dead vbucket refuses all of
    /// them, a pending one parks the cookie.
    fn check_access(&self, cookie: Option<Cookie>) -> Result<()> {
        match self.state() {
            VBucketState::Active => Ok(()),
            VBucketState::Pending => {
                if let Some(c) = cookie {
                    self.pending_ops.lock().push(c);
                }
                Err(EmberError::WouldBlock)
            }
            VBucketState::Replica | VBucketState::Dead => {
                self.stats
                    .num_not_my_vbuckets
                    .fetch_add(1, Ordering::Relaxed);
                Err(EmberError::NotMyVbucket)
            }
        }
    }

    // ---- reads ------------------------------------------------------

    pub fn get(&self, key: &[u8], cookie: Option<Cookie>) -> Result<Item> {
        self.check_access(cookie)?;
        self.stats.num_gets.fetch_add(1, Ordering::Relaxed);
        let now = unix_now();

        let outcome = {
            let mut guard = self.ht.lock_key(key);
            match guard.find(key, true, true) {
                Some(sv) if sv.temp => ReadOutcome::WaitExisting,
                Some(sv) if sv.deleted => ReadOutcome::Miss,
                Some(sv) if sv.is_expired(now) => ReadOutcome::Expired,
                Some(sv) if !sv.is_resident() => ReadOutcome::FetchValue,
                Some(sv) => {
                    let mut item = sv.to_item();
                    if sv.is_locked(Instant::now()) {
                        item.meta.cas = LOCKED_CAS;
                    }
                    ReadOutcome::Hit(item)
                }
                None => self.miss_outcome(key),
            }
        };

        self.resolve_read(key, cookie, outcome, false)
    }

    /// Decide what a table miss means under the eviction policy.
    fn miss_outcome(&self, key: &[u8]) -> ReadOutcome {
        if self.ht.eviction_policy() == EvictionPolicy::FullEviction {
            let maybe_on_disk = match self.bloom.lock().as_ref() {
                Some(filter) => filter.maybe_contains(key),
                None => true,
            };
            if maybe_on_disk {
                ReadOutcome::FetchFull
            } else {
                self.stats
                    .bloom_skipped_fetches
                    .fetch_add(1, Ordering::Relaxed);
                ReadOutcome::Miss
            }
        } else {
            ReadOutcome::Miss
        }
    }

    fn resolve_read(
        &self,
        key: &[u8],
        cookie: Option<Cookie>,
        outcome: ReadOutcome,
        meta_only: bool,
    ) -> Result<Item> {
        match outcome {
            ReadOutcome::Hit(item) => Ok(item),
            ReadOutcome::Miss => Err(EmberError::KeyNotFound),
            ReadOutcome::Expired => {
                self.process_expiry(key, ExpirySource::Access);
                Err(EmberError::KeyNotFound)
            }
            ReadOutcome::FetchValue | ReadOutcome::WaitExisting => {
                self.queue_bg_fetch(key, cookie, meta_only);
                Err(EmberError::WouldBlock)
            }
            ReadOutcome::FetchFull => {
                self.add_temp_and_fetch_opt(key, cookie, meta_only);
                Err(EmberError::WouldBlock)
            }
        }
    }

    /// Metadata-only read; surfaces tombstones. A miss probes disk unless
    /// the bloom filter rules the key out.
    pub fn get_meta(&self, key: &[u8], cookie: Option<Cookie>) -> Result<(ItemMeta, bool, u8)> {
        self.check_access(cookie)?;

        let outcome = {
            let mut guard = self.ht.lock_key(key);
            match guard.find(key, true, false) {
                Some(sv) if sv.temp => ReadOutcome::WaitExisting,
                Some(sv) => {
                    let mut item = sv.to_item();
                    item.value = bytes::Bytes::new();
                    ReadOutcome::Hit(item)
                }
                None => {
                    // a tombstone may exist only on disk under either policy
                    let maybe_on_disk = match self.bloom.lock().as_ref() {
                        Some(filter) => filter.maybe_contains(key),
                        None => true,
                    };
                    if maybe_on_disk {
                        ReadOutcome::FetchFull
                    } else {
                        self.stats
                            .bloom_skipped_fetches
                            .fetch_add(1, Ordering::Relaxed);
                        ReadOutcome::Miss
                    }
                }
            }
        };

        self.resolve_read(key, cookie, outcome, true)
            .map(|item| (item.meta, item.deleted, item.datatype))
    }

    // ---- mutation pipeline ------------------------------------------

    /// Stamp, append to the open checkpoint, apply to the table and mark
    /// dirty; the heart of every accepted mutation.
    fn commit_mutation(
        &self,
        guard: &mut crate::core::hash_table::HashBucketLock<'_>,
        existing: bool,
        item: &mut Item,
        generate_cas: bool,
    ) {
        let cas_source = if generate_cas { Some(&self.hlc) } else { None };
        self.checkpoints
            .queue_dirty(item, &self.high_seqno, cas_source);

        if existing {
            guard.mutate(&item.key, |sv| {
                sv.replace_from(item);
                sv.dirty = true;
            });
        } else {
            let mut sv = StoredValue::from_item(item);
            sv.dirty = true;
            guard.insert(sv);
        }

        if let Some(filter) = self.bloom.lock().as_mut() {
            filter.insert(&item.key);
        }
        if item.deleted {
            self.max_deleted_rev
                .fetch_max(item.meta.rev_seqno, Ordering::AcqRel);
        }
    }

    pub fn set(&self, mut item: Item, cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.check_access(cookie)?;
        self.stats.num_sets.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        enum Plan {
            Update { rev: u64 },
            Insert,
            Fail(EmberError),
            Fetch,
        }

        let mut guard = self.ht.lock_key(&item.key);
        let plan = match guard.find(&item.key, true, false) {
            Some(sv) => {
                if sv.check_and_expire_lock(now) && (cas == 0 || cas != sv.cas) {
                    Plan::Fail(EmberError::Locked)
                } else if cas != 0 && (sv.deleted || sv.temp) {
                    Plan::Fail(EmberError::KeyNotFound)
                } else if cas != 0 && cas != sv.cas {
                    Plan::Fail(EmberError::KeyExists)
                } else {
                    Plan::Update {
                        rev: sv.rev_seqno + 1,
                    }
                }
            }
            None if cas != 0 => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(&item.key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Fail(EmberError::KeyNotFound)
                    }
                } else {
                    Plan::Fail(EmberError::KeyNotFound)
                }
            }
            None => Plan::Insert,
        };

        match plan {
            Plan::Fail(e) => Err(e),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(&item.key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::Update { rev } => {
                let was_deleted_or_temp = guard
                    .find(&item.key, true, false)
                    .map(|sv| sv.deleted || sv.temp)
                    .unwrap_or(false);
                item.meta.rev_seqno = rev;
                item.deleted = false;
                self.commit_mutation(&mut guard, true, &mut item, true);
                if was_deleted_or_temp {
                    self.ht
                        .counters
                        .num_total_items
                        .fetch_add(1, Ordering::AcqRel);
                }
                Ok(item.meta.cas)
            }
            Plan::Insert => {
                item.meta.rev_seqno = 1;
                item.deleted = false;
                self.commit_mutation(&mut guard, false, &mut item, true);
                self.ht
                    .counters
                    .num_total_items
                    .fetch_add(1, Ordering::AcqRel);
                Ok(item.meta.cas)
            }
        }
    }

    pub fn add(&self, mut item: Item, cookie: Option<Cookie>) -> Result<u64> {
        self.check_access(cookie)?;
        self.stats.num_sets.fetch_add(1, Ordering::Relaxed);
        let now = unix_now();

        enum Plan {
            Insert,
            UnDel { rev: u64 },
            Fail(EmberError),
            Fetch,
        }

        let mut guard = self.ht.lock_key(&item.key);
        let plan = match guard.find(&item.key, true, false) {
            Some(sv) if sv.temp => Plan::Fetch,
            Some(sv) if sv.deleted => Plan::UnDel {
                rev: sv.rev_seqno + 1,
            },
            Some(sv) if sv.is_expired(now) => Plan::UnDel {
                rev: sv.rev_seqno + 1,
            },
            Some(_) => Plan::Fail(EmberError::KeyExists),
            None => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(&item.key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Insert
                    }
                } else {
                    Plan::Insert
                }
            }
        };

        match plan {
            Plan::Fail(e) => Err(e),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(&item.key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::UnDel { rev } => {
                item.meta.rev_seqno = rev;
                item.deleted = false;
                self.commit_mutation(&mut guard, true, &mut item, true);
                self.ht
                    .counters
                    .num_total_items
                    .fetch_add(1, Ordering::AcqRel);
                Ok(item.meta.cas)
            }
            Plan::Insert => {
                item.meta.rev_seqno = 1;
                item.deleted = false;
                self.commit_mutation(&mut guard, false, &mut item, true);
                self.ht
                    .counters
                    .num_total_items
                    .fetch_add(1, Ordering::AcqRel);
                Ok(item.meta.cas)
            }
        }
    }

    pub fn replace(&self, mut item: Item, cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.check_access(cookie)?;
        self.stats.num_sets.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        enum Plan {
            Update { rev: u64 },
            Fail(EmberError),
            Fetch,
        }

        let mut guard = self.ht.lock_key(&item.key);
        let plan = match guard.find(&item.key, true, false) {
            Some(sv) if sv.temp => Plan::Fetch,
            Some(sv) if sv.deleted => Plan::Fail(EmberError::KeyNotFound),
            Some(sv) if sv.is_locked(now) && (cas == 0 || cas != sv.cas) => {
                Plan::Fail(EmberError::Locked)
            }
            Some(sv) if cas != 0 && cas != sv.cas => Plan::Fail(EmberError::KeyExists),
            Some(sv) => Plan::Update {
                rev: sv.rev_seqno + 1,
            },
            None => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(&item.key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Fail(EmberError::KeyNotFound)
                    }
                } else {
                    Plan::Fail(EmberError::KeyNotFound)
                }
            }
        };

        match plan {
            Plan::Fail(e) => Err(e),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(&item.key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::Update { rev } => {
                item.meta.rev_seqno = rev;
                item.deleted = false;
                self.commit_mutation(&mut guard, true, &mut item, true);
                Ok(item.meta.cas)
            }
        }
    }

    pub fn delete(&self, key: &[u8], cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.check_access(cookie)?;
        self.stats.num_deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        enum Plan {
            SoftDelete { meta: ItemMeta },
            Fail(EmberError),
            Fetch,
        }

        let mut guard = self.ht.lock_key(key);
        let plan = match guard.find(key, true, false) {
            Some(sv) if sv.temp => Plan::Fetch,
            Some(sv) if sv.deleted => Plan::Fail(EmberError::KeyNotFound),
            Some(sv) if sv.is_locked(now) && (cas == 0 || cas != sv.cas) => {
                Plan::Fail(EmberError::Locked)
            }
            Some(sv) if cas != 0 && cas != sv.cas => Plan::Fail(EmberError::KeyExists),
            Some(sv) => Plan::SoftDelete {
                meta: ItemMeta {
                    rev_seqno: sv.rev_seqno + 1,
                    ..sv.meta()
                },
            },
            None => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Fail(EmberError::KeyNotFound)
                    }
                } else {
                    Plan::Fail(EmberError::KeyNotFound)
                }
            }
        };

        match plan {
            Plan::Fail(e) => Err(e),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::SoftDelete { meta } => {
                let mut tombstone = Item::tombstone(key.to_vec(), meta);
                self.commit_mutation(&mut guard, true, &mut tombstone, true);
                sub_guarded(&self.ht.counters.num_total_items, 1, "num_total_items");
                Ok(tombstone.meta.cas)
            }
        }
    }

    /// Read and update the expiration in one revision.
    pub fn get_and_touch(
        &self,
        key: &[u8],
        new_exptime: u32,
        cookie: Option<Cookie>,
    ) -> Result<Item> {
        self.check_access(cookie)?;
        let now = unix_now();

        enum Plan {
            Touch(Item),
            Outcome(ReadOutcome),
        }

        let mut guard = self.ht.lock_key(key);
        let plan = match guard.find(key, true, true) {
            Some(sv) if sv.temp => Plan::Outcome(ReadOutcome::WaitExisting),
            Some(sv) if sv.deleted => Plan::Outcome(ReadOutcome::Miss),
            Some(sv) if sv.is_expired(now) => Plan::Outcome(ReadOutcome::Expired),
            Some(sv) if sv.is_locked(Instant::now()) => {
                return Err(EmberError::Locked);
            }
            Some(sv) if !sv.is_resident() => Plan::Outcome(ReadOutcome::FetchValue),
            Some(sv) => {
                let mut item = sv.to_item();
                item.meta.exptime = new_exptime;
                item.meta.rev_seqno = sv.rev_seqno + 1;
                Plan::Touch(item)
            }
            None => Plan::Outcome(self.miss_outcome(key)),
        };

        match plan {
            Plan::Touch(mut item) => {
                self.commit_mutation(&mut guard, true, &mut item, true);
                Ok(item)
            }
            Plan::Outcome(outcome) => {
                drop(guard);
                self.resolve_read(key, cookie, outcome, false)
            }
        }
    }

    // ---- GETL -------------------------------------------------------

    /// Lock the document for `timeout` (clamped); the returned item holds
    /// the real CAS, which is the unlock token.
    pub fn get_locked(
        &self,
        key: &[u8],
        timeout: Option<Duration>,
        cookie: Option<Cookie>,
    ) -> Result<Item> {
        self.check_access(cookie)?;
        let now = Instant::now();
        let timeout = timeout
            .unwrap_or(self.opts.getl_default_timeout)
            .min(self.opts.getl_max_timeout);

        enum Plan {
            Locked(Item),
            Outcome(ReadOutcome),
        }

        let mut guard = self.ht.lock_key(key);
        let plan = match guard.find(key, true, true) {
            Some(sv) if sv.temp => Plan::Outcome(ReadOutcome::WaitExisting),
            Some(sv) if sv.deleted => Plan::Outcome(ReadOutcome::Miss),
            Some(sv) if sv.is_expired(unix_now()) => Plan::Outcome(ReadOutcome::Expired),
            Some(sv) if sv.is_locked(now) => {
                return Err(EmberError::Locked);
            }
            Some(sv) if !sv.is_resident() => Plan::Outcome(ReadOutcome::FetchValue),
            Some(sv) => {
                sv.lock_expiry = Some(now + timeout);
                Plan::Locked(sv.to_item())
            }
            None => Plan::Outcome(self.miss_outcome(key)),
        };

        match plan {
            Plan::Locked(item) => Ok(item),
            Plan::Outcome(outcome) => {
                drop(guard);
                self.resolve_read(key, cookie, outcome, false)
            }
        }
    }

    pub fn unlock(&self, key: &[u8], cas: u64, cookie: Option<Cookie>) -> Result<()> {
        self.check_access(cookie)?;
        let now = Instant::now();

        let mut guard = self.ht.lock_key(key);
        match guard.find(key, false, false) {
            Some(sv) => {
                if !sv.check_and_expire_lock(now) {
                    return Err(EmberError::TempFail);
                }
                if sv.cas != cas {
                    return Err(EmberError::Locked);
                }
                sv.lock_expiry = None;
                Ok(())
            }
            None => Err(EmberError::KeyNotFound),
        }
    }

    // ---- XDCR meta ops ----------------------------------------------

    /// Apply a remote revision under conflict resolution. The incoming
    /// meta is compared `(revSeqno, cas, expiration, flags)` against the
    /// stored copy; the larger tuple wins unless `force` is set.
    pub fn set_with_meta(
        &self,
        mut item: Item,
        force: bool,
        cookie: Option<Cookie>,
    ) -> Result<WithMetaOutcome> {
        self.check_access(cookie)?;
        self.stats.num_sets.fetch_add(1, Ordering::Relaxed);

        enum Plan {
            Apply { existing: bool, new_key: bool },
            Skip,
            Fetch,
        }

        let mut guard = self.ht.lock_key(&item.key);
        let plan = match guard.find(&item.key, true, false) {
            Some(sv) if sv.temp => Plan::Fetch,
            Some(sv) => {
                if force || item.meta.wins_over(&sv.meta()) {
                    Plan::Apply {
                        existing: true,
                        new_key: sv.deleted,
                    }
                } else {
                    Plan::Skip
                }
            }
            None => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction && !force {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(&item.key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Apply {
                            existing: false,
                            new_key: true,
                        }
                    }
                } else {
                    Plan::Apply {
                        existing: false,
                        new_key: true,
                    }
                }
            }
        };

        match plan {
            Plan::Skip => Ok(WithMetaOutcome::Skipped),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(&item.key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::Apply { existing, new_key } => {
                self.hlc.observe_cas(item.meta.cas);
                item.deleted = false;
                self.commit_mutation(&mut guard, existing, &mut item, false);
                if new_key {
                    self.ht
                        .counters
                        .num_total_items
                        .fetch_add(1, Ordering::AcqRel);
                }
                Ok(WithMetaOutcome::Stored {
                    cas: item.meta.cas,
                })
            }
        }
    }

    pub fn del_with_meta(
        &self,
        key: &[u8],
        meta: ItemMeta,
        force: bool,
        cookie: Option<Cookie>,
    ) -> Result<WithMetaOutcome> {
        self.check_access(cookie)?;
        self.stats.num_deletes.fetch_add(1, Ordering::Relaxed);

        enum Plan {
            Apply { existing: bool, was_alive: bool },
            Skip,
            Fetch,
        }

        let mut guard = self.ht.lock_key(key);
        let plan = match guard.find(key, true, false) {
            Some(sv) if sv.temp => Plan::Fetch,
            Some(sv) => {
                if force || meta.wins_over(&sv.meta()) {
                    Plan::Apply {
                        existing: true,
                        was_alive: !sv.deleted,
                    }
                } else {
                    Plan::Skip
                }
            }
            None => {
                if self.ht.eviction_policy() == EvictionPolicy::FullEviction && !force {
                    let maybe = match self.bloom.lock().as_ref() {
                        Some(f) => f.maybe_contains(key),
                        None => true,
                    };
                    if maybe {
                        Plan::Fetch
                    } else {
                        Plan::Apply {
                            existing: false,
                            was_alive: false,
                        }
                    }
                } else {
                    Plan::Apply {
                        existing: false,
                        was_alive: false,
                    }
                }
            }
        };

        match plan {
            Plan::Skip => Ok(WithMetaOutcome::Skipped),
            Plan::Fetch => {
                drop(guard);
                self.add_temp_and_fetch(key, cookie);
                Err(EmberError::WouldBlock)
            }
            Plan::Apply { existing, was_alive } => {
                self.hlc.observe_cas(meta.cas);
                let mut tombstone = Item::tombstone(key.to_vec(), meta);
                self.commit_mutation(&mut guard, existing, &mut tombstone, false);
                if was_alive {
                    sub_guarded(&self.ht.counters.num_total_items, 1, "num_total_items");
                }
                Ok(WithMetaOutcome::Stored {
                    cas: tombstone.meta.cas,
                })
            }
        }
    }

    // ---- expiry -----------------------------------------------------

    /// Turn an expired document into a tombstone through the normal
    /// pipeline; conflict resolution is bypassed.
    pub fn process_expiry(&self, key: &[u8], source: ExpirySource) {
        let now = unix_now();
        let mut guard = self.ht.lock_key(key);
        let meta = match guard.find(key, false, false) {
            Some(sv) if sv.is_expired(now) && !sv.temp => ItemMeta {
                rev_seqno: sv.rev_seqno + 1,
                ..sv.meta()
            },
            _ => return,
        };

        let mut tombstone = Item::tombstone(key.to_vec(), meta);
        self.commit_mutation(&mut guard, true, &mut tombstone, true);
        sub_guarded(&self.ht.counters.num_total_items, 1, "num_total_items");
        drop(guard);

        self.num_expired.fetch_add(1, Ordering::Relaxed);
        let counter = match source {
            ExpirySource::Access => &self.stats.expired_access,
            ExpirySource::Pager => &self.stats.expired_pager,
            ExpirySource::Compactor => &self.stats.expired_compactor,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // ---- background fetch -------------------------------------------

    /// Park a temp placeholder and request a full fetch (full eviction
    /// misses and meta reads).
    fn add_temp_and_fetch(&self, key: &[u8], cookie: Option<Cookie>) {
        self.add_temp_and_fetch_opt(key, cookie, false);
    }

    fn add_temp_and_fetch_opt(&self, key: &[u8], cookie: Option<Cookie>, meta_only: bool) {
        {
            let mut guard = self.ht.lock_key(key);
            if guard.find(key, true, false).is_none() {
                guard.insert(StoredValue::new_temp(key.to_vec()));
            }
        }
        self.queue_bg_fetch(key, cookie, meta_only);
    }

    fn queue_bg_fetch(&self, key: &[u8], cookie: Option<Cookie>, meta_only: bool) {
        let mut queue = self.bg_queue.lock();
        let entry = queue
            .entry(key.to_vec())
            .or_insert_with(|| BgFetchItem {
                cookies: Vec::new(),
                meta_only,
                start: Instant::now(),
            });
        // a value fetch subsumes a meta fetch for the same key
        entry.meta_only = entry.meta_only && meta_only;
        if let Some(c) = cookie {
            entry.cookies.push(c);
            self.stats.bg_remaining_jobs.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Take the whole outstanding fetch queue; called by the fetcher.
    pub fn take_bg_fetches(&self) -> HashMap<Vec<u8>, BgFetchItem> {
        std::mem::take(&mut *self.bg_queue.lock())
    }

    /// Re-park fetches that could not run (file not created yet).
    pub fn requeue_bg_fetches(&self, fetches: HashMap<Vec<u8>, BgFetchItem>) {
        let mut queue = self.bg_queue.lock();
        for (key, item) in fetches {
            match queue.get_mut(&key) {
                Some(existing) => {
                    existing.cookies.extend(item.cookies);
                    existing.meta_only = existing.meta_only && item.meta_only;
                }
                None => {
                    queue.insert(key, item);
                }
            }
        }
    }

    /// Fold a completed fetch back into the table and resume its cookies.
    pub fn complete_bg_fetch(&self, key: &[u8], fetched: Option<Item>, entry: BgFetchItem) {
        let status = {
            let mut guard = self.ht.lock_key(key);
            match &fetched {
                Some(item) => {
                    let applied = guard
                        .mutate(key, |sv| {
                            if sv.temp {
                                sv.restore_meta(item);
                                if !entry.meta_only && !item.deleted {
                                    sv.restore_value(item);
                                }
                                true
                            } else if !sv.is_resident() && !sv.deleted {
                                sv.restore_value(item);
                                true
                            } else {
                                // superseded by a concurrent mutation
                                false
                            }
                        })
                        .unwrap_or(false);
                    if !applied {
                        tracing::debug!(vb = self.id, "fetched document already superseded");
                    }
                    NotifyStatus::Success
                }
                None => {
                    // nothing on disk; drop the placeholder
                    let is_temp = guard
                        .find(key, true, false)
                        .map(|sv| sv.temp)
                        .unwrap_or(false);
                    if is_temp {
                        guard.release(key);
                    }
                    NotifyStatus::KeyNotFound
                }
            }
        };

        let wait_ns = entry.start.elapsed().as_nanos() as u64;
        self.stats.record_bg_fetch_wait(wait_ns);
        if entry.meta_only {
            self.stats.bg_meta_fetched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        }
        if !entry.cookies.is_empty() {
            sub_guarded(
                &self.stats.bg_remaining_jobs,
                entry.cookies.len(),
                "bg_remaining_jobs",
            );
        }

        for cookie in &entry.cookies {
            self.notifier.notify_io_complete(*cookie, status);
        }
    }

    // ---- eviction ----------------------------------------------------

    /// Explicit ejection of one key (the EVICT_KEY operation).
    pub fn evict_key(&self, key: &[u8]) -> Result<()> {
        self.check_access(None)?;
        let mut guard = self.ht.lock_key(key);
        match guard.find(key, false, false) {
            Some(sv) if !sv.is_resident() => Err(EmberError::KeyExists),
            Some(sv) if sv.dirty => Err(EmberError::TempFail),
            Some(_) => {
                if guard.eject(key) {
                    Ok(())
                } else {
                    Err(EmberError::TempFail)
                }
            }
            None => Err(EmberError::KeyNotFound),
        }
    }

    // ---- state machine ----------------------------------------------

    /// `active ↔ replica ↔ pending`, `any → dead`. A transition to active
    /// starts a new failover lineage (unless ownership is merely being
    /// transferred) and resumes parked cookies.
    pub fn set_state(&self, new_state: VBucketState, transfer: bool) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        tracing::info!(vb = self.id, from = %old_state, to = %new_state, "vbucket state change");

        if new_state == VBucketState::Active && old_state != VBucketState::Active {
            if !transfer {
                self.failover.lock().create_entry(self.high_seqno());
            }
            for cookie in self.pending_ops.lock().drain(..) {
                self.notifier
                    .notify_io_complete(cookie, NotifyStatus::Success);
            }
        }

        if new_state == VBucketState::Dead {
            self.notify_all_pending(NotifyStatus::NotMyVbucket);
        }
    }

    /// Resume every parked cookie with `status`, exactly once each.
    pub fn notify_all_pending(&self, status: NotifyStatus) {
        for cookie in self.pending_ops.lock().drain(..) {
            self.notifier.notify_io_complete(cookie, status);
        }
        for (_, entry) in self.bg_queue.lock().drain() {
            if !entry.cookies.is_empty() {
                sub_guarded(
                    &self.stats.bg_remaining_jobs,
                    entry.cookies.len(),
                    "bg_remaining_jobs",
                );
            }
            for cookie in entry.cookies {
                self.notifier.notify_io_complete(cookie, status);
            }
        }
    }

    /// Asynchronous teardown: refuse further ops, fail waiters, drop all
    /// in-memory state. The on-disk file is deleted by the owner.
    pub fn tear_down(&self) {
        self.set_state(VBucketState::Dead, false);
        self.checkpoints.clear(self.high_seqno());
        self.ht.clear();
    }

    // ---- persistence plumbing ---------------------------------------

    /// Applied by the flusher after a successful commit: clears dirty
    /// flags, unlinks persisted tombstones and advances the persisted
    /// seqno watermarks.
    pub fn on_persisted(&self, items: &[Item], snap_start: u64, snap_end: u64) {
        for item in items {
            let mut guard = self.ht.lock_key(&item.key);
            if item.deleted {
                let matches = guard
                    .find(&item.key, true, false)
                    .map(|sv| sv.deleted && sv.by_seqno == item.by_seqno)
                    .unwrap_or(false);
                if matches {
                    guard.release(&item.key);
                }
            } else {
                guard.mutate(&item.key, |sv| {
                    if sv.by_seqno == item.by_seqno {
                        sv.dirty = false;
                    }
                });
            }
        }
        if let Some(last) = items.last() {
            self.last_persisted_seqno
                .fetch_max(last.by_seqno, Ordering::AcqRel);
        }
        self.last_persisted_snap_start
            .store(snap_start, Ordering::Release);
        self.last_persisted_snap_end
            .fetch_max(snap_end, Ordering::AcqRel);
        self.stats
            .total_persisted
            .fetch_add(items.len() as u64, Ordering::Relaxed);
    }

    /// Load one document image during warmup, bypassing the mutation
    /// pipeline; the record arrives clean. Returns false on a duplicate.
    pub fn warm_insert(&self, item: &Item, resident: bool) -> bool {
        let mut guard = self.ht.lock_key(&item.key);
        if guard.find(&item.key, true, false).is_some() {
            if resident {
                // key dump loaded the metadata earlier; attach the value
                return guard.restore_value(item);
            }
            return false;
        }
        let mut sv = StoredValue::from_item(item);
        if !resident {
            sv.eject_value();
        }
        guard.insert(sv);
        true
    }

    /// Seed the bloom filter with an on-disk key during warmup.
    pub fn warm_bloom_key(&self, key: &[u8]) {
        if let Some(filter) = self.bloom.lock().as_mut() {
            filter.insert(key);
        }
    }

    /// Everything on disk at startup is persisted by definition.
    pub fn seed_persisted(&self, seqno: u64, snap_start: u64, snap_end: u64) {
        self.last_persisted_seqno.store(seqno, Ordering::Release);
        self.last_persisted_snap_start
            .store(snap_start, Ordering::Release);
        self.last_persisted_snap_end
            .store(snap_end, Ordering::Release);
    }

    /// Start a fresh failover lineage (warmup completion).
    pub fn new_failover_entry(&self) -> u64 {
        self.failover.lock().create_entry(self.high_seqno())
    }

    /// The record the flusher persists alongside every batch.
    pub fn state_record(&self) -> VbStateRecord {
        VbStateRecord {
            state: self.state(),
            checkpoint_id: self.checkpoints.persistence_checkpoint_id(),
            max_deleted_seqno: self.max_deleted_rev.load(Ordering::Acquire),
            failover_table: self.failover_entries(),
            snap_start: self.last_persisted_snap_start.load(Ordering::Acquire),
            snap_end: self.last_persisted_snap_end.load(Ordering::Acquire),
            max_cas: self.hlc.max_cas(),
            hlc_drift_ahead_us: self.opts.hlc_drift_ahead_us,
            hlc_drift_behind_us: self.opts.hlc_drift_behind_us,
        }
    }

    /// Advance the purge seqno after compaction removed everything at or
    /// below `purged_up_to`.
    pub fn set_purge_seqno(&self, purged_up_to: u64) {
        self.purge_seqno.fetch_max(purged_up_to, Ordering::AcqRel);
    }

    /// Swap in a freshly rebuilt bloom filter (compaction).
    pub fn swap_bloom_filter(&self, filter: Option<BloomFilter>) {
        *self.bloom.lock() = filter;
    }

    pub fn bloom_info(&self) -> Option<(usize, f64)> {
        self.bloom
            .lock()
            .as_ref()
            .map(|f| (f.key_count(), f.fp_probability()))
    }

    /// `(last_persisted_seqno, current_seqno)` plus the rollback point if
    /// `vb_uuid` belongs to a stale lineage.
    pub fn observe_seqno(&self, vb_uuid: u64) -> (u64, u64, Option<u64>) {
        let rollback = self.failover.lock().needs_rollback(vb_uuid);
        (
            self.last_persisted_seqno(),
            self.high_seqno(),
            rollback,
        )
    }

    /// Per-key persistence observation for OBSERVE.
    pub fn observe_key(&self, key: &[u8]) -> (u8, u64) {
        const NOT_PERSISTED: u8 = 0x00;
        const PERSISTED: u8 = 0x01;
        const NOT_FOUND: u8 = 0x80;
        const LOGICALLY_DELETED: u8 = 0x81;

        let mut guard = self.ht.lock_key(key);
        match guard.find(key, true, false) {
            Some(sv) if sv.temp => (NOT_FOUND, 0),
            Some(sv) if sv.deleted => (LOGICALLY_DELETED, sv.cas),
            Some(sv) if sv.dirty => (NOT_PERSISTED, sv.cas),
            Some(sv) => (PERSISTED, sv.cas),
            None => (NOT_FOUND, 0),
        }
    }
}
