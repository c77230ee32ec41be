use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Decrement a gauge-style counter, refusing to wrap below zero.
///
/// An attempted underflow leaves the counter at zero and is logged; gauge
/// drift is recoverable, a wrapped counter is not.
pub fn sub_guarded(counter: &AtomicUsize, delta: usize, name: &'static str) {
    let mut cur = counter.load(Ordering::Relaxed);
    loop {
        let next = match cur.checked_sub(delta) {
            Some(v) => v,
            None => {
                tracing::warn!(counter = name, value = cur, delta, "counter underflow");
                0
            }
        };
        match counter.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => cur = observed,
        }
    }
}

/// Central statistics hub for the engine.
#[derive(Debug, Default)]
pub struct Statistics {
    // Memory accounting
    pub mem_used: AtomicUsize,

    // Operation counters
    pub num_gets: AtomicU64,
    pub num_sets: AtomicU64,
    pub num_deletes: AtomicU64,
    pub num_temp_fails: AtomicU64,
    pub num_not_my_vbuckets: AtomicU64,

    // Expiration, broken out by the path that observed it
    pub expired_access: AtomicU64,
    pub expired_pager: AtomicU64,
    pub expired_compactor: AtomicU64,

    // Background fetch
    pub bg_fetched: AtomicU64,
    pub bg_meta_fetched: AtomicU64,
    pub bg_fetch_wait_ns: AtomicU64,
    pub bg_fetch_max_wait_ns: AtomicU64,
    pub bg_remaining_jobs: AtomicUsize,

    // Persistence
    pub total_persisted: AtomicU64,
    pub flusher_commits: AtomicU64,
    pub item_commit_failed: AtomicU64,
    pub flusher_todo: AtomicUsize,
    pub diskqueue_items: AtomicUsize,
    pub diskqueue_mem: AtomicUsize,

    // Item pager
    pub pager_runs: AtomicU64,
    pub num_value_ejects: AtomicU64,
    pub num_eject_failures: AtomicU64,

    // Expiry pager
    pub expiry_pager_runs: AtomicU64,

    // Bloom filter
    pub bloom_skipped_fetches: AtomicU64,

    // Warmup
    pub warmup_item_count: AtomicU64,
    pub warmup_value_count: AtomicU64,
    pub warmup_dups: AtomicU64,
    pub warmup_oom: AtomicU64,
    pub warmup_time_ns: AtomicU64,

    // Access scanner
    pub access_scanner_runs: AtomicU64,
    pub access_scanner_skips: AtomicU64,
    pub access_scanner_items: AtomicU64,

    // Defragmenter
    pub defrag_visited: AtomicU64,
    pub defrag_moved: AtomicU64,

    // Compaction
    pub compactions: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mem_used(&self, bytes: usize) {
        self.mem_used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub_mem_used(&self, bytes: usize) {
        sub_guarded(&self.mem_used, bytes, "mem_used");
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Acquire)
    }

    pub fn record_bg_fetch_wait(&self, wait_ns: u64) {
        self.bg_fetch_wait_ns.fetch_add(wait_ns, Ordering::Relaxed);
        self.bg_fetch_max_wait_ns
            .fetch_max(wait_ns, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let bg_fetched = self.bg_fetched.load(Ordering::Relaxed);
        let avg_bg_wait_ns = if bg_fetched > 0 {
            self.bg_fetch_wait_ns.load(Ordering::Relaxed) / bg_fetched
        } else {
            0
        };

        StatsSnapshot {
            mem_used: self.mem_used.load(Ordering::Relaxed),
            num_gets: self.num_gets.load(Ordering::Relaxed),
            num_sets: self.num_sets.load(Ordering::Relaxed),
            num_deletes: self.num_deletes.load(Ordering::Relaxed),
            expired_access: self.expired_access.load(Ordering::Relaxed),
            expired_pager: self.expired_pager.load(Ordering::Relaxed),
            expired_compactor: self.expired_compactor.load(Ordering::Relaxed),
            bg_fetched,
            bg_meta_fetched: self.bg_meta_fetched.load(Ordering::Relaxed),
            avg_bg_wait_ns,
            total_persisted: self.total_persisted.load(Ordering::Relaxed),
            flusher_commits: self.flusher_commits.load(Ordering::Relaxed),
            item_commit_failed: self.item_commit_failed.load(Ordering::Relaxed),
            diskqueue_items: self.diskqueue_items.load(Ordering::Relaxed),
            pager_runs: self.pager_runs.load(Ordering::Relaxed),
            num_value_ejects: self.num_value_ejects.load(Ordering::Relaxed),
            expiry_pager_runs: self.expiry_pager_runs.load(Ordering::Relaxed),
            bloom_skipped_fetches: self.bloom_skipped_fetches.load(Ordering::Relaxed),
            warmup_item_count: self.warmup_item_count.load(Ordering::Relaxed),
            warmup_value_count: self.warmup_value_count.load(Ordering::Relaxed),
            warmup_oom: self.warmup_oom.load(Ordering::Relaxed),
            warmup_time_ns: self.warmup_time_ns.load(Ordering::Relaxed),
            access_scanner_runs: self.access_scanner_runs.load(Ordering::Relaxed),
            access_scanner_skips: self.access_scanner_skips.load(Ordering::Relaxed),
            defrag_visited: self.defrag_visited.load(Ordering::Relaxed),
            defrag_moved: self.defrag_moved.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.num_gets.store(0, Ordering::Relaxed);
        self.num_sets.store(0, Ordering::Relaxed);
        self.num_deletes.store(0, Ordering::Relaxed);
        self.num_temp_fails.store(0, Ordering::Relaxed);
        self.num_not_my_vbuckets.store(0, Ordering::Relaxed);
        self.expired_access.store(0, Ordering::Relaxed);
        self.expired_pager.store(0, Ordering::Relaxed);
        self.expired_compactor.store(0, Ordering::Relaxed);
        self.bg_fetched.store(0, Ordering::Relaxed);
        self.bg_meta_fetched.store(0, Ordering::Relaxed);
        self.bg_fetch_wait_ns.store(0, Ordering::Relaxed);
        self.bg_fetch_max_wait_ns.store(0, Ordering::Relaxed);
        self.total_persisted.store(0, Ordering::Relaxed);
        self.flusher_commits.store(0, Ordering::Relaxed);
        self.item_commit_failed.store(0, Ordering::Relaxed);
        self.pager_runs.store(0, Ordering::Relaxed);
        self.num_value_ejects.store(0, Ordering::Relaxed);
        self.num_eject_failures.store(0, Ordering::Relaxed);
        self.expiry_pager_runs.store(0, Ordering::Relaxed);
        self.bloom_skipped_fetches.store(0, Ordering::Relaxed);
        self.access_scanner_runs.store(0, Ordering::Relaxed);
        self.access_scanner_skips.store(0, Ordering::Relaxed);
        self.access_scanner_items.store(0, Ordering::Relaxed);
        self.defrag_visited.store(0, Ordering::Relaxed);
        self.defrag_moved.store(0, Ordering::Relaxed);
        self.compactions.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of statistics at a point in time.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub mem_used: usize,
    pub num_gets: u64,
    pub num_sets: u64,
    pub num_deletes: u64,
    pub expired_access: u64,
    pub expired_pager: u64,
    pub expired_compactor: u64,
    pub bg_fetched: u64,
    pub bg_meta_fetched: u64,
    pub avg_bg_wait_ns: u64,
    pub total_persisted: u64,
    pub flusher_commits: u64,
    pub item_commit_failed: u64,
    pub diskqueue_items: usize,
    pub pager_runs: u64,
    pub num_value_ejects: u64,
    pub expiry_pager_runs: u64,
    pub bloom_skipped_fetches: u64,
    pub warmup_item_count: u64,
    pub warmup_value_count: u64,
    pub warmup_oom: u64,
    pub warmup_time_ns: u64,
    pub access_scanner_runs: u64,
    pub access_scanner_skips: u64,
    pub defrag_visited: u64,
    pub defrag_moved: u64,
    pub compactions: u64,
}

impl StatsSnapshot {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "=== Engine Statistics ===\n\
            Memory:\n\
            - Used: {:.2} MB\n\n\
            Operations:\n\
            - Gets: {}\n\
            - Sets: {}\n\
            - Deletes: {}\n\n\
            Expiration:\n\
            - On access: {}\n\
            - Pager: {}\n\
            - Compactor: {}\n\n\
            Background fetch:\n\
            - Values: {}\n\
            - Meta: {}\n\
            - Avg wait: {:.2}us\n\
            - Skipped by bloom filter: {}\n\n\
            Persistence:\n\
            - Items persisted: {}\n\
            - Commits: {}\n\
            - Commit failures: {}\n\
            - Disk queue: {}\n\n\
            Paging:\n\
            - Pager runs: {}\n\
            - Value ejects: {}\n\n\
            Warmup:\n\
            - Keys: {}\n\
            - Values: {}\n\
            - OOM: {}\n\
            - Time: {:.2}ms",
            self.mem_used as f64 / 1_048_576.0,
            self.num_gets,
            self.num_sets,
            self.num_deletes,
            self.expired_access,
            self.expired_pager,
            self.expired_compactor,
            self.bg_fetched,
            self.bg_meta_fetched,
            self.avg_bg_wait_ns as f64 / 1000.0,
            self.bloom_skipped_fetches,
            self.total_persisted,
            self.flusher_commits,
            self.item_commit_failed,
            self.diskqueue_items,
            self.pager_runs,
            self.num_value_ejects,
            self.warmup_item_count,
            self.warmup_value_count,
            self.warmup_oom,
            self.warmup_time_ns as f64 / 1_000_000.0,
        )
    }
}
