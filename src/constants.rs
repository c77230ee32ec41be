use std::time::Duration;

// Size units
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

// Key/value limits (memcached-compatible key bound)
pub const MAX_KEY_SIZE: usize = 250;
pub const MAX_VALUE_SIZE: usize = 20 * MB;

// Memory quota defaults
pub const DEFAULT_MAX_SIZE: usize = GB;
pub const DEFAULT_MEM_HIGH_WAT_PCT: f64 = 0.85;
pub const DEFAULT_MEM_LOW_WAT_PCT: f64 = 0.75;

// Hash table configuration
pub const DEFAULT_HT_SIZE: usize = 3079;
pub const DEFAULT_HT_LOCKS: usize = 47;
pub const HT_MAX_LOAD_FACTOR: usize = 3;

// Hash table sizes follow a prime ladder so chains stay short after resize
pub const HT_PRIME_SIZES: [usize; 14] = [
    3, 7, 13, 23, 47, 97, 193, 383, 769, 3079, 6151, 12289, 24593, 49157,
];

// Bucket topology
pub const DEFAULT_MAX_VBUCKETS: u16 = 1024;
pub const DEFAULT_MAX_SHARDS: usize = 4;

// Scheduler
pub const MIN_SLEEP_TIME: Duration = Duration::from_secs(2);

// Checkpointing
pub const DEFAULT_CHECKPOINT_MAX_ITEMS: usize = 500;
pub const DEFAULT_COMPACTION_WRITE_QUEUE_CAP: usize = 10_000;

// Per-item NRU aging; 0 = just touched, MAX_NRU = eligible for ejection
pub const INITIAL_NRU: u8 = 2;
pub const MAX_NRU: u8 = 3;

// Item pager
pub const DEFAULT_PAGER_ACTIVE_VB_PCNT: usize = 40;
pub const PAGER_VISIT_CHUNK: usize = 1000;

// Expiry pager
pub const DEFAULT_EXP_PAGER_STIME: Duration = Duration::from_secs(3600);

// Bloom filter
pub const DEFAULT_BFILTER_FP_PROB: f64 = 0.01;
pub const DEFAULT_BFILTER_KEY_COUNT: usize = 10_000;
pub const DEFAULT_BFILTER_RESIDENCY_THRESHOLD: f64 = 0.1;

// GETL
pub const DEFAULT_GETL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_GETL_MAX_TIMEOUT: Duration = Duration::from_secs(30);

// A locked document advertises this CAS; producers must never emit it
pub const LOCKED_CAS: u64 = u64::MAX;

// Background fetch
pub const DEFAULT_BG_FETCH_DELAY: Duration = Duration::from_secs(0);

// Access scanner
pub const DEFAULT_ALOG_SLEEP_TIME: Duration = Duration::from_secs(1440 * 60);
pub const DEFAULT_ALOG_TASK_TIME_HOUR: u32 = 2;
pub const ACCESS_LOG_NAME: &str = "access.log";

// Warmup thresholds, percentages of the estimated item count / memory quota
pub const DEFAULT_WARMUP_MIN_ITEMS_THRESHOLD: usize = 100;
pub const DEFAULT_WARMUP_MIN_MEMORY_THRESHOLD: usize = 100;

// HLC drift thresholds
pub const DEFAULT_HLC_DRIFT_AHEAD_US: u64 = 5_000_000;
pub const DEFAULT_HLC_DRIFT_BEHIND_US: u64 = 5_000_000;

// Defragmenter
pub const DEFAULT_DEFRAG_AGE_THRESHOLD: u8 = 10;
pub const DEFAULT_DEFRAG_INTERVAL: Duration = Duration::from_secs(600);

// Datatype bitmask, persisted and restored exactly
pub const DATATYPE_RAW: u8 = 0x00;
pub const DATATYPE_JSON: u8 = 0x01;
pub const DATATYPE_SNAPPY: u8 = 0x02;
pub const DATATYPE_XATTR: u8 = 0x04;
pub const DATATYPE_MASK: u8 = DATATYPE_JSON | DATATYPE_SNAPPY | DATATYPE_XATTR;
