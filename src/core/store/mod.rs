mod operations;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::constants::*;
use crate::core::hash_table::EvictionPolicy;
use crate::core::notifier::{ChannelNotifier, Cookie, EngineNotifier};
use crate::core::shard::Shard;
use crate::core::vbucket::{VBucket, VBucketOptions};
use crate::error::{EmberError, Result};
use crate::executor::task::TaskHandle;
use crate::executor::{ExecutorPool, ThreadCounts};
use crate::stats::Statistics;
use crate::storage::bgfetcher::BgFetcherTask;
use crate::storage::file_kvstore::FileKVStore;
use crate::storage::flusher::FlusherTask;
use crate::tasks::access_scanner::AccessScannerTask;
use crate::tasks::defragmenter::DefragmenterTask;
use crate::tasks::expiry_pager::ExpiryPagerTask;
use crate::tasks::item_pager::ItemPagerTask;
use crate::tasks::resizer::HashtableResizerTask;
use crate::utils::time::secs_until_hour;
use crate::warmup::Warmup;

/// Engine configuration. `StoreBuilder` is the ergonomic way to make one.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub max_vbuckets: u16,
    pub max_num_shards: usize,
    pub ht_size: usize,
    pub ht_locks: usize,
    pub max_size: usize,
    pub mem_high_wat: Option<usize>,
    pub mem_low_wat: Option<usize>,
    pub item_eviction_policy: EvictionPolicy,
    pub exp_pager_enabled: bool,
    pub exp_pager_stime: Duration,
    /// Wall-clock hour (0-23) for the first expiry-pager run.
    pub exp_pager_initial_run_time: Option<u32>,
    pub alog_path: Option<PathBuf>,
    pub alog_task_time: u32,
    pub alog_sleep_time: Duration,
    pub access_scanner_enabled: bool,
    pub bfilter_enabled: bool,
    pub bfilter_fp_prob: f64,
    pub bfilter_key_count: usize,
    pub bfilter_residency_threshold: f64,
    pub compaction_write_queue_cap: usize,
    pub checkpoint_max_items: usize,
    pub warmup_enabled: bool,
    pub warmup_min_items_threshold: usize,
    pub warmup_min_memory_threshold: usize,
    pub bg_fetch_delay: Duration,
    pub max_num_writers: usize,
    pub max_num_readers: usize,
    pub max_num_auxio: usize,
    pub max_num_nonio: usize,
    pub getl_default_timeout: Duration,
    pub getl_max_timeout: Duration,
    pub hlc_drift_ahead_threshold_us: u64,
    pub hlc_drift_behind_threshold_us: u64,
    pub pager_active_vb_pcnt: usize,
    pub defragmenter_enabled: bool,
    pub defragmenter_interval: Duration,
    pub defragmenter_age_threshold: u8,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            data_dir: data_dir.into(),
            max_vbuckets: DEFAULT_MAX_VBUCKETS,
            max_num_shards: DEFAULT_MAX_SHARDS,
            ht_size: DEFAULT_HT_SIZE,
            ht_locks: DEFAULT_HT_LOCKS,
            max_size: DEFAULT_MAX_SIZE,
            mem_high_wat: None,
            mem_low_wat: None,
            item_eviction_policy: EvictionPolicy::ValueOnly,
            exp_pager_enabled: true,
            exp_pager_stime: DEFAULT_EXP_PAGER_STIME,
            exp_pager_initial_run_time: None,
            alog_path: None,
            alog_task_time: DEFAULT_ALOG_TASK_TIME_HOUR,
            alog_sleep_time: DEFAULT_ALOG_SLEEP_TIME,
            access_scanner_enabled: true,
            bfilter_enabled: true,
            bfilter_fp_prob: DEFAULT_BFILTER_FP_PROB,
            bfilter_key_count: DEFAULT_BFILTER_KEY_COUNT,
            bfilter_residency_threshold: DEFAULT_BFILTER_RESIDENCY_THRESHOLD,
            compaction_write_queue_cap: DEFAULT_COMPACTION_WRITE_QUEUE_CAP,
            checkpoint_max_items: DEFAULT_CHECKPOINT_MAX_ITEMS,
            warmup_enabled: true,
            warmup_min_items_threshold: DEFAULT_WARMUP_MIN_ITEMS_THRESHOLD,
            warmup_min_memory_threshold: DEFAULT_WARMUP_MIN_MEMORY_THRESHOLD,
            bg_fetch_delay: DEFAULT_BG_FETCH_DELAY,
            max_num_writers: cpus.clamp(1, 4),
            max_num_readers: cpus.clamp(1, 4),
            max_num_auxio: 1,
            max_num_nonio: 1,
            getl_default_timeout: DEFAULT_GETL_TIMEOUT,
            getl_max_timeout: DEFAULT_GETL_MAX_TIMEOUT,
            hlc_drift_ahead_threshold_us: DEFAULT_HLC_DRIFT_AHEAD_US,
            hlc_drift_behind_threshold_us: DEFAULT_HLC_DRIFT_BEHIND_US,
            pager_active_vb_pcnt: DEFAULT_PAGER_ACTIVE_VB_PCNT,
            defragmenter_enabled: true,
            defragmenter_interval: DEFAULT_DEFRAG_INTERVAL,
            defragmenter_age_threshold: DEFAULT_DEFRAG_AGE_THRESHOLD,
        }
    }

    pub fn mem_high_wat(&self) -> usize {
        self.mem_high_wat
            .unwrap_or((self.max_size as f64 * DEFAULT_MEM_HIGH_WAT_PCT) as usize)
    }

    pub fn mem_low_wat(&self) -> usize {
        self.mem_low_wat
            .unwrap_or((self.max_size as f64 * DEFAULT_MEM_LOW_WAT_PCT) as usize)
    }
}

/// Fluent construction of an [`EmberStore`].
///
/// # Example
///
/// ```no_run
/// use emberkv::EmberStore;
///
/// # fn main() -> emberkv::Result<()> {
/// let store = EmberStore::builder("/var/lib/ember")
///     .max_size(512 * 1024 * 1024)
///     .max_vbuckets(64)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder {
    config: StoreConfig,
    notifier: Option<Arc<dyn EngineNotifier>>,
}

impl StoreBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: StoreConfig::new(data_dir),
            notifier: None,
        }
    }

    /// Memory quota in bytes; the watermarks derive from it unless set
    /// explicitly.
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.config.max_size = bytes;
        self
    }

    pub fn mem_high_wat(mut self, bytes: usize) -> Self {
        self.config.mem_high_wat = Some(bytes);
        self
    }

    pub fn mem_low_wat(mut self, bytes: usize) -> Self {
        self.config.mem_low_wat = Some(bytes);
        self
    }

    pub fn max_vbuckets(mut self, n: u16) -> Self {
        self.config.max_vbuckets = n.max(1);
        self
    }

    pub fn max_num_shards(mut self, n: usize) -> Self {
        self.config.max_num_shards = n.max(1);
        self
    }

    pub fn ht_size(mut self, size: usize) -> Self {
        self.config.ht_size = size.max(1);
        self
    }

    pub fn ht_locks(mut self, locks: usize) -> Self {
        self.config.ht_locks = locks.max(1);
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.item_eviction_policy = policy;
        self
    }

    pub fn bfilter_enabled(mut self, enabled: bool) -> Self {
        self.config.bfilter_enabled = enabled;
        self
    }

    pub fn exp_pager_stime(mut self, stime: Duration) -> Self {
        self.config.exp_pager_stime = stime;
        self
    }

    pub fn warmup(mut self, enabled: bool) -> Self {
        self.config.warmup_enabled = enabled;
        self
    }

    /// Replace the default channel notifier with the embedder's own.
    pub fn notifier(mut self, notifier: Arc<dyn EngineNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config_mut(&mut self) -> &mut StoreConfig {
        &mut self.config
    }

    pub fn build(self) -> Result<Arc<EmberStore>> {
        EmberStore::open(self.config, self.notifier)
    }
}

/// The bucket engine: shards, vbuckets, scheduling fabric and the client
/// operation surface. All methods are thread-safe.
pub struct EmberStore {
    config: StoreConfig,
    shards: Vec<Arc<Shard>>,
    pool: Arc<ExecutorPool>,
    stats: Arc<Statistics>,
    notifier: Arc<dyn EngineNotifier>,
    engine_specific: DashMap<Cookie, Bytes>,
    traffic_enabled: AtomicBool,
    cluster_config: Mutex<Bytes>,
    pager_task: Mutex<Option<Arc<TaskHandle>>>,
    aux_tasks: Mutex<Vec<Arc<TaskHandle>>>,
    random_seed: AtomicUsize,
    shutting_down: AtomicBool,
}

impl EmberStore {
    pub fn builder(data_dir: impl Into<PathBuf>) -> StoreBuilder {
        StoreBuilder::new(data_dir)
    }

    /// Open the store: spin up shards and workers, run warmup against the
    /// persisted files, then schedule the background tasks.
    pub fn open(
        config: StoreConfig,
        notifier: Option<Arc<dyn EngineNotifier>>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let stats = Arc::new(Statistics::new());
        let notifier = match notifier {
            Some(n) => n,
            None => {
                let (n, _rx) = ChannelNotifier::new();
                Arc::new(n) as Arc<dyn EngineNotifier>
            }
        };

        let pool = ExecutorPool::new(ThreadCounts {
            writers: config.max_num_writers,
            readers: config.max_num_readers,
            auxio: config.max_num_auxio,
            nonio: config.max_num_nonio,
        });

        let mut shards = Vec::with_capacity(config.max_num_shards);
        for shard_id in 0..config.max_num_shards.max(1) {
            let shard_dir = config.data_dir.join(format!("shard_{shard_id}"));
            let kvstore = Box::new(FileKVStore::open(shard_dir)?);
            shards.push(Shard::new(
                shard_id,
                kvstore,
                stats.clone(),
                config.compaction_write_queue_cap,
                config.bg_fetch_delay,
            ));
        }

        let store = Arc::new(Self {
            config,
            shards,
            pool,
            stats,
            notifier,
            engine_specific: DashMap::new(),
            traffic_enabled: AtomicBool::new(false),
            cluster_config: Mutex::new(Bytes::new()),
            pager_task: Mutex::new(None),
            aux_tasks: Mutex::new(Vec::new()),
            random_seed: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let mut degraded = false;
        if store.config.warmup_enabled {
            let mut warmup = Warmup::new();
            warmup.run(&store)?;
            degraded = warmup.hit_oom();
        }
        store.traffic_enabled.store(!degraded, Ordering::Release);

        Self::schedule_tasks(&store);
        tracing::info!(
            data_dir = %store.config.data_dir.display(),
            shards = store.shards.len(),
            degraded,
            "store open"
        );
        Ok(store)
    }

    fn schedule_tasks(store: &Arc<Self>) {
        let self_ = store.as_ref();
        let weak_pool = Arc::downgrade(&self_.pool);
        for shard in &self_.shards {
            let flusher_handle = self_.pool.schedule(
                Box::new(FlusherTask {
                    flusher: shard.flusher().clone(),
                    shard_id: shard.id,
                }),
                Duration::ZERO,
            );
            shard
                .flusher()
                .set_task(weak_pool.clone(), flusher_handle);

            let fetcher_handle = self_.pool.schedule(
                Box::new(BgFetcherTask {
                    fetcher: shard.bgfetcher().clone(),
                    shard_id: shard.id,
                }),
                Duration::ZERO,
            );
            shard
                .bgfetcher()
                .set_task(weak_pool.clone(), fetcher_handle);
        }

        let weak = Arc::downgrade(store);
        let pager = self_
            .pool
            .schedule(Box::new(ItemPagerTask::new(weak.clone())), Duration::from_secs(10));
        *self_.pager_task.lock() = Some(pager);

        let mut aux = self_.aux_tasks.lock();

        if self_.config.exp_pager_enabled {
            let initial = match self_.config.exp_pager_initial_run_time {
                Some(hour) => Duration::from_secs(secs_until_hour(hour)),
                None => self_.config.exp_pager_stime,
            };
            aux.push(self_.pool.schedule(
                Box::new(ExpiryPagerTask::new(weak.clone(), self_.config.exp_pager_stime)),
                initial,
            ));
        }

        aux.push(self_.pool.schedule(
            Box::new(HashtableResizerTask::new(weak.clone())),
            Duration::from_secs(60),
        ));

        if self_.config.defragmenter_enabled {
            aux.push(self_.pool.schedule(
                Box::new(DefragmenterTask::new(
                    weak.clone(),
                    self_.config.defragmenter_interval,
                    self_.config.defragmenter_age_threshold,
                )),
                self_.config.defragmenter_interval,
            ));
        }

        if self_.config.access_scanner_enabled {
            let base = self_
                .config
                .alog_path
                .clone()
                .unwrap_or_else(|| self_.config.data_dir.clone());
            aux.push(self_.pool.schedule(
                Box::new(AccessScannerTask::new(
                    weak,
                    base,
                    self_.config.alog_sleep_time,
                    self_.config.bfilter_residency_threshold,
                )),
                Duration::from_secs(secs_until_hour(self_.config.alog_task_time)),
            ));
        }
    }

    // ---- accessors shared with the background tasks ------------------

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn snapshot_stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn mem_high_wat(&self) -> usize {
        self.config.mem_high_wat()
    }

    pub fn mem_low_wat(&self) -> usize {
        self.config.mem_low_wat()
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.config.item_eviction_policy
    }

    pub fn warmup_min_items_threshold(&self) -> usize {
        self.config.warmup_min_items_threshold
    }

    pub fn warmup_min_memory_threshold(&self) -> usize {
        self.config.warmup_min_memory_threshold
    }

    pub fn notifier(&self) -> Arc<dyn EngineNotifier> {
        self.notifier.clone()
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn shard_for(&self, vb: u16) -> &Arc<Shard> {
        &self.shards[vb as usize % self.shards.len()]
    }

    pub fn all_vbuckets(&self) -> Vec<Arc<VBucket>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for id in shard.vbucket_ids() {
                if let Some(vb) = shard.get_vbucket(id) {
                    out.push(vb);
                }
            }
        }
        out.sort_by_key(|vb| vb.id);
        out
    }

    /// How many vbuckets of the pager pass go to actives first.
    pub fn pager_active_share(&self) -> usize {
        let total = self.shards.iter().map(|s| s.num_vbuckets()).sum::<usize>();
        total * self.config.pager_active_vb_pcnt / 100
    }

    /// `(num_items, num_non_resident)` across every vbucket.
    pub fn residency_counts(&self) -> (usize, usize) {
        let mut items = 0;
        let mut non_resident = 0;
        for vb in self.all_vbuckets() {
            items += vb.ht.counters.num_items.load(Ordering::Acquire);
            non_resident += vb.ht.counters.num_non_resident.load(Ordering::Acquire);
        }
        (items, non_resident)
    }

    pub(crate) fn vbucket_options(&self) -> VBucketOptions {
        VBucketOptions {
            ht_size: self.config.ht_size,
            ht_locks: self.config.ht_locks,
            eviction_policy: self.config.item_eviction_policy,
            checkpoint_max_items: self.config.checkpoint_max_items,
            bfilter_enabled: self.config.bfilter_enabled,
            bfilter_fp_prob: self.config.bfilter_fp_prob,
            bfilter_key_count: self.config.bfilter_key_count,
            getl_default_timeout: self.config.getl_default_timeout,
            getl_max_timeout: self.config.getl_max_timeout,
            hlc_drift_ahead_us: self.config.hlc_drift_ahead_threshold_us,
            hlc_drift_behind_us: self.config.hlc_drift_behind_threshold_us,
        }
    }

    pub(crate) fn vb(&self, id: u16) -> Result<Arc<VBucket>> {
        if id >= self.config.max_vbuckets {
            return Err(EmberError::NotMyVbucket);
        }
        self.shard_for(id)
            .get_vbucket(id)
            .ok_or(EmberError::NotMyVbucket)
    }

    pub(crate) fn notify_flushers(&self) {
        for shard in &self.shards {
            shard.flusher().notify();
        }
    }

    pub(crate) fn wake_pager(&self) {
        if let Some(handle) = self.pager_task.lock().as_ref() {
            self.pool.wake(handle);
        }
    }

    pub(crate) fn random_seed(&self) -> usize {
        self.random_seed.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn traffic_enabled(&self) -> bool {
        self.traffic_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_traffic(&self, enabled: bool) {
        self.traffic_enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "traffic control");
    }

    pub(crate) fn cluster_config_blob(&self) -> &Mutex<Bytes> {
        &self.cluster_config
    }

    /// Per-cookie engine-specific data, the second half of the suspended
    /// cookie protocol.
    pub fn store_engine_specific(&self, cookie: Cookie, data: Bytes) {
        self.engine_specific.insert(cookie, data);
    }

    pub fn get_engine_specific(&self, cookie: Cookie) -> Option<Bytes> {
        self.engine_specific.get(&cookie).map(|e| e.clone())
    }

    pub fn clear_engine_specific(&self, cookie: Cookie) {
        self.engine_specific.remove(&cookie);
    }

    pub fn executor_pool(&self) -> &Arc<ExecutorPool> {
        &self.pool
    }

    /// Stop background processing; unflushed mutations stay in their
    /// checkpoints (the store is eventually persistent, not durable).
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("store shutting down");
        for shard in &self.shards {
            shard.flusher().stop();
        }
        self.pool.shutdown();
    }
}

impl Drop for EmberStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
