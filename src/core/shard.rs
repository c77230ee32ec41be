use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::core::vbucket::VBucket;
use crate::stats::Statistics;
use crate::storage::bgfetcher::BgFetcher;
use crate::storage::flusher::Flusher;
use crate::storage::kvstore::KVStore;

/// One slice of the bucket: the vbuckets mapped to it (`vb % num_shards`),
/// one flusher, one background fetcher and the KV store handle they share.
/// The flusher is the sole writer through the handle.
pub struct Shard {
    pub id: usize,
    vbuckets: RwLock<HashMap<u16, Arc<VBucket>>>,
    pub store: Mutex<Box<dyn KVStore>>,
    flusher: Arc<Flusher>,
    bgfetcher: Arc<BgFetcher>,
}

impl Shard {
    pub fn new(
        id: usize,
        store: Box<dyn KVStore>,
        stats: Arc<Statistics>,
        flush_batch_cap: usize,
        bg_fetch_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Shard {
            id,
            vbuckets: RwLock::new(HashMap::new()),
            store: Mutex::new(store),
            flusher: Arc::new(Flusher::new(weak.clone(), stats, flush_batch_cap)),
            bgfetcher: Arc::new(BgFetcher::new(weak.clone(), bg_fetch_delay)),
        })
    }

    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    pub fn bgfetcher(&self) -> &Arc<BgFetcher> {
        &self.bgfetcher
    }

    pub fn set_vbucket(&self, vb: Arc<VBucket>) {
        self.vbuckets.write().insert(vb.id, vb);
    }

    pub fn get_vbucket(&self, id: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.read().get(&id).cloned()
    }

    pub fn remove_vbucket(&self, id: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.write().remove(&id)
    }

    pub fn vbucket_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.vbuckets.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.read().len()
    }
}
