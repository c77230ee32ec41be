use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::failover::FailoverEntry;
use crate::core::item::{Item, ItemMeta};
use crate::core::vbucket::VBucketState;
use crate::error::Result;

/// What a scan should materialize for each document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFilter {
    KeysOnly,
    Values,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Per-key context for a batched read; the store fills `item` in place
/// (`None` after the call means the key is not on disk).
#[derive(Debug)]
pub struct FetchCtx {
    pub meta_only: bool,
    pub item: Option<Item>,
}

impl FetchCtx {
    pub fn new(meta_only: bool) -> Self {
        Self {
            meta_only,
            item: None,
        }
    }
}

/// The vbucket-state record persisted alongside every flush batch.
///
/// Legacy records lack the failover/snapshot/max_cas fields; serde
/// defaults accept them and the warmup path synthesizes a fresh lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbStateRecord {
    pub state: VBucketState,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    #[serde(default)]
    pub failover_table: Vec<FailoverEntry>,
    #[serde(default)]
    pub snap_start: u64,
    #[serde(default)]
    pub snap_end: u64,
    #[serde(default)]
    pub max_cas: u64,
    #[serde(default)]
    pub hlc_drift_ahead_us: u64,
    #[serde(default)]
    pub hlc_drift_behind_us: u64,
}

/// Compaction parameters plus the callbacks the engine hooks in: one to
/// rebuild the bloom filter from surviving keys, one to report live
/// documents found expired (the engine deletes those through the normal
/// pipeline).
pub struct CompactionCtx<'a> {
    pub purge_before_seqno: u64,
    pub drop_deletes: bool,
    pub now: u32,
    pub surviving_key: Option<&'a mut dyn FnMut(&[u8], bool)>,
    pub expired: Option<&'a mut dyn FnMut(Item)>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionResult {
    /// Highest seqno removed; 0 when nothing was purged.
    pub purged_up_to: u64,
    pub tombstones_purged: u64,
    pub file_size_before: u64,
    pub file_size_after: u64,
}

/// The persistent per-vbucket key-value store the core flushes to and
/// fetches from. One implementation handle per shard; the flusher is the
/// sole writer through it.
pub trait KVStore: Send {
    fn get(&self, vb: u16, key: &[u8]) -> Result<Option<Item>>;

    /// Populate each context with the fetched item or leave it `None`.
    fn get_multi(&self, vb: u16, fetches: &mut HashMap<Vec<u8>, FetchCtx>) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn set(&mut self, vb: u16, item: &Item) -> Result<()>;

    fn del(&mut self, vb: u16, key: &[u8], seqno: u64, meta: &ItemMeta) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn snapshot_vbucket(&mut self, vb: u16, record: &VbStateRecord) -> Result<()>;

    fn compact_db(&mut self, vb: u16, ctx: &mut CompactionCtx<'_>) -> Result<CompactionResult>;

    fn list_persisted_vbuckets(&self) -> Result<Vec<(u16, VbStateRecord)>>;

    fn scan(
        &self,
        vb: u16,
        start_seqno: u64,
        end_seqno: u64,
        filter: ValueFilter,
        callback: &mut dyn FnMut(Item) -> ScanControl,
    ) -> Result<()>;

    fn get_item_count(&self, vb: u16) -> Result<usize>;

    fn get_db_file_size(&self, vb: u16) -> Result<u64>;

    fn get_db_data_size(&self, vb: u16) -> Result<u64>;

    fn high_seqno(&self, vb: u16) -> Result<u64>;

    fn delete_vbucket(&mut self, vb: u16) -> Result<()>;
}
