use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::constants::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::core::item::{Item, ItemMeta};
use crate::core::notifier::Cookie;
use crate::core::store::EmberStore;
use crate::core::vbucket::{ExpirySource, VBucketState, WithMetaOutcome};
use crate::core::bloom::BloomFilter;
use crate::error::{EmberError, Result};
use crate::storage::kvstore::{CompactionCtx, ScanControl, ValueFilter};
use crate::utils::time::unix_now;

impl EmberStore {
    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(EmberError::InvalidKeySize);
        }
        Ok(())
    }

    fn validate_item(&self, item: &Item) -> Result<()> {
        self.validate_key(&item.key)?;
        if item.value.len() > MAX_VALUE_SIZE {
            return Err(EmberError::InvalidValueSize);
        }
        Ok(())
    }

    /// Admission control for every write: degraded mode and checkpoint
    /// back-pressure surface as temporary failures, quota exhaustion as
    /// hard out-of-memory.
    fn admit_write(&self, incoming: usize) -> Result<()> {
        if !self.traffic_enabled() {
            self.stats().num_temp_fails.fetch_add(1, Ordering::Relaxed);
            return Err(EmberError::TempFail);
        }
        let used = self.stats().mem_used();
        if used + incoming > self.max_size() {
            self.wake_pager();
            return Err(EmberError::NoMemory);
        }
        if used > self.mem_high_wat() {
            self.wake_pager();
        }
        if self.stats().diskqueue_mem.load(Ordering::Acquire) > self.max_size() / 2 {
            self.stats().num_temp_fails.fetch_add(1, Ordering::Relaxed);
            return Err(EmberError::TempFail);
        }
        Ok(())
    }

    /// A data op that returned WouldBlock may have parked a fetch; make
    /// sure the shard's fetcher knows.
    fn after_would_block(&self, vbid: u16) {
        let shard = self.shard_for(vbid);
        let has_fetches = shard
            .get_vbucket(vbid)
            .map(|vb| vb.bg_queue_len() > 0)
            .unwrap_or(false);
        if has_fetches {
            shard.bgfetcher().notify_bg_event(vbid);
        }
    }

    fn after_mutation(&self, vbid: u16) {
        self.shard_for(vbid).flusher().notify();
    }

    fn relay<T>(&self, vbid: u16, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.after_mutation(vbid),
            Err(EmberError::WouldBlock) => self.after_would_block(vbid),
            Err(_) => {}
        }
        result
    }

    // ---- reads -------------------------------------------------------

    /// GET / GETK / GETQ.
    pub fn get(&self, vb: u16, key: &[u8]) -> Result<Item> {
        self.get_with_cookie(vb, key, None)
    }

    pub fn get_with_cookie(&self, vb: u16, key: &[u8], cookie: Option<Cookie>) -> Result<Item> {
        self.validate_key(key)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.get(key, cookie);
        if matches!(result, Err(EmberError::WouldBlock)) {
            self.after_would_block(vb);
        }
        // an expiry-on-access writes a tombstone worth flushing
        if matches!(result, Err(EmberError::KeyNotFound)) {
            self.after_mutation(vb);
        }
        result
    }

    /// GET_META.
    pub fn get_meta(
        &self,
        vb: u16,
        key: &[u8],
        cookie: Option<Cookie>,
    ) -> Result<(ItemMeta, bool, u8)> {
        self.validate_key(key)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.get_meta(key, cookie);
        if matches!(result, Err(EmberError::WouldBlock)) {
            self.after_would_block(vb);
        }
        result
    }

    // ---- writes ------------------------------------------------------

    /// SET with the default metadata.
    pub fn set(&self, vb: u16, key: &[u8], value: impl Into<Bytes>) -> Result<u64> {
        self.set_item(vb, Item::new(key.to_vec(), value.into()), 0, None)
    }

    /// SET / CAS; `cas != 0` demands the stored CAS match.
    pub fn set_item(&self, vb: u16, item: Item, cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.validate_item(&item)?;
        self.admit_write(item.size())?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.set(item, cas, cookie);
        self.relay(vb, result)
    }

    /// ADD: store only when the key is absent (tombstones revive).
    pub fn add(&self, vb: u16, item: Item, cookie: Option<Cookie>) -> Result<u64> {
        self.validate_item(&item)?;
        self.admit_write(item.size())?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.add(item, cookie);
        self.relay(vb, result)
    }

    /// REPLACE: store only when the key already exists.
    pub fn replace(&self, vb: u16, item: Item, cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.validate_item(&item)?;
        self.admit_write(item.size())?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.replace(item, cas, cookie);
        self.relay(vb, result)
    }

    /// DELETE.
    pub fn delete(&self, vb: u16, key: &[u8], cas: u64, cookie: Option<Cookie>) -> Result<u64> {
        self.validate_key(key)?;
        self.admit_write(0)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.delete(key, cas, cookie);
        self.relay(vb, result)
    }

    /// TOUCH: update the expiration, returning the new CAS.
    pub fn touch(&self, vb: u16, key: &[u8], exptime: u32, cookie: Option<Cookie>) -> Result<u64> {
        self.get_and_touch(vb, key, exptime, cookie).map(|i| i.meta.cas)
    }

    /// GAT: get and update the expiration in one revision.
    pub fn get_and_touch(
        &self,
        vb: u16,
        key: &[u8],
        exptime: u32,
        cookie: Option<Cookie>,
    ) -> Result<Item> {
        self.validate_key(key)?;
        self.admit_write(0)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.get_and_touch(key, exptime, cookie);
        self.relay(vb, result)
    }

    /// GETL: lock the document and return it; the CAS is the lock token.
    pub fn get_locked(
        &self,
        vb: u16,
        key: &[u8],
        timeout: Option<Duration>,
        cookie: Option<Cookie>,
    ) -> Result<Item> {
        self.validate_key(key)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.get_locked(key, timeout, cookie);
        if matches!(result, Err(EmberError::WouldBlock)) {
            self.after_would_block(vb);
        }
        result
    }

    /// UNLOCK.
    pub fn unlock(&self, vb: u16, key: &[u8], cas: u64, cookie: Option<Cookie>) -> Result<()> {
        self.validate_key(key)?;
        let vbucket = self.vb(vb)?;
        vbucket.unlock(key, cas, cookie)
    }

    /// SET_WITH_META: apply a remote revision under conflict resolution.
    pub fn set_with_meta(
        &self,
        vb: u16,
        item: Item,
        force: bool,
        cookie: Option<Cookie>,
    ) -> Result<WithMetaOutcome> {
        self.validate_item(&item)?;
        self.admit_write(item.size())?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.set_with_meta(item, force, cookie);
        match &result {
            Ok(WithMetaOutcome::Stored { .. }) => self.after_mutation(vb),
            Err(EmberError::WouldBlock) => self.after_would_block(vb),
            _ => {}
        }
        result
    }

    /// DEL_WITH_META.
    pub fn del_with_meta(
        &self,
        vb: u16,
        key: &[u8],
        meta: ItemMeta,
        force: bool,
        cookie: Option<Cookie>,
    ) -> Result<WithMetaOutcome> {
        self.validate_key(key)?;
        self.admit_write(0)?;
        let vbucket = self.vb(vb)?;
        let result = vbucket.del_with_meta(key, meta, force, cookie);
        match &result {
            Ok(WithMetaOutcome::Stored { .. }) => self.after_mutation(vb),
            Err(EmberError::WouldBlock) => self.after_would_block(vb),
            _ => {}
        }
        result
    }

    /// EVICT_KEY: push a clean value out of memory immediately.
    pub fn evict_key(&self, vb: u16, key: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        let vbucket = self.vb(vb)?;
        vbucket.evict_key(key)
    }

    /// GET_RANDOM_KEY from any active vbucket.
    pub fn get_random_key(&self) -> Result<Vec<u8>> {
        let vbuckets: Vec<_> = self
            .all_vbuckets()
            .into_iter()
            .filter(|vb| vb.state() == VBucketState::Active)
            .collect();
        if vbuckets.is_empty() {
            return Err(EmberError::KeyNotFound);
        }
        let start = rand::rng().random_range(0..vbuckets.len());
        for offset in 0..vbuckets.len() {
            let vb = &vbuckets[(start + offset) % vbuckets.len()];
            if let Some(key) = vb.ht.random_key(self.random_seed()) {
                return Ok(key);
            }
        }
        Err(EmberError::KeyNotFound)
    }

    /// GET_KEYS: bounded key-range scan over the persisted index. A
    /// vbucket that has never flushed has no persisted keys yet.
    pub fn get_keys(&self, vb: u16, start_key: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        let vbucket = self.vb(vb)?;
        if vbucket.is_bucket_creation() {
            return Ok(Vec::new());
        }
        let shard = self.shard_for(vb);
        let mut keys = Vec::new();
        shard.store.lock().scan(
            vb,
            0,
            u64::MAX,
            ValueFilter::KeysOnly,
            &mut |item| {
                if !item.deleted && item.key.as_slice() >= start_key {
                    keys.push(item.key);
                }
                ScanControl::Continue
            },
        )?;
        keys.sort_unstable();
        keys.truncate(count);
        Ok(keys)
    }

    /// GET_ALL_VB_SEQNOS, optionally filtered by state.
    pub fn get_all_vb_seqnos(&self, state: Option<VBucketState>) -> Vec<(u16, u64)> {
        self.all_vbuckets()
            .into_iter()
            .filter(|vb| state.map_or(true, |s| vb.state() == s))
            .map(|vb| (vb.id, vb.high_seqno()))
            .collect()
    }

    // ---- observation -------------------------------------------------

    /// OBSERVE: per-key persistence state, wire-encoded.
    pub fn observe(&self, keys: &[(u16, Vec<u8>)]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (vbid, key) in keys {
            let vbucket = self.vb(*vbid)?;
            let (state, cas) = vbucket.observe_key(key);
            out.extend_from_slice(&vbid.to_be_bytes());
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(key);
            out.push(state);
            out.extend_from_slice(&cas.to_be_bytes());
        }
        Ok(out)
    }

    /// OBSERVE_SEQNO: persistence watermarks plus failover indication.
    pub fn observe_seqno(&self, vb: u16, vb_uuid: u64) -> Result<Vec<u8>> {
        let vbucket = self.vb(vb)?;
        let (last_persisted, current, rollback) = vbucket.observe_seqno(vb_uuid);
        let current_uuid = vbucket.current_uuid();

        let mut out = Vec::new();
        match rollback {
            Some(rollback_seqno) => {
                out.push(1); // failover format
                out.extend_from_slice(&vb.to_be_bytes());
                out.extend_from_slice(&current_uuid.to_be_bytes());
                out.extend_from_slice(&last_persisted.to_be_bytes());
                out.extend_from_slice(&current.to_be_bytes());
                out.extend_from_slice(&vb_uuid.to_be_bytes());
                out.extend_from_slice(&rollback_seqno.to_be_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&vb.to_be_bytes());
                out.extend_from_slice(&current_uuid.to_be_bytes());
                out.extend_from_slice(&last_persisted.to_be_bytes());
                out.extend_from_slice(&current.to_be_bytes());
            }
        }
        Ok(out)
    }

    // ---- vbucket administration -------------------------------------

    /// SET_VBUCKET: create or transition.
    pub fn set_vbucket_state(
        &self,
        vbid: u16,
        state: VBucketState,
        transfer: bool,
    ) -> Result<()> {
        if vbid >= self.config().max_vbuckets {
            return Err(EmberError::NotMyVbucket);
        }
        let shard = self.shard_for(vbid);
        match shard.get_vbucket(vbid) {
            Some(vb) => {
                vb.set_state(state, transfer);
            }
            None => {
                let vb = std::sync::Arc::new(crate::core::vbucket::VBucket::new(
                    vbid,
                    state,
                    self.vbucket_options(),
                    Default::default(),
                    self.notifier(),
                    self.stats().clone(),
                ));
                shard.set_vbucket(vb);
            }
        }
        Ok(())
    }

    /// GET_VBUCKET.
    pub fn get_vbucket_state(&self, vbid: u16) -> Result<VBucketState> {
        Ok(self.vb(vbid)?.state())
    }

    /// DEL_VBUCKET: asynchronous teardown then file removal.
    pub fn delete_vbucket(&self, vbid: u16) -> Result<()> {
        let shard = self.shard_for(vbid);
        let vb = shard.remove_vbucket(vbid).ok_or(EmberError::NotMyVbucket)?;
        vb.tear_down();
        shard.store.lock().delete_vbucket(vbid)?;
        Ok(())
    }

    // ---- compaction --------------------------------------------------

    /// COMPACT_DB: purge tombstones on disk, rebuild the bloom filter and
    /// reap expired documents through the normal delete path.
    pub fn compact_db(&self, vbid: u16, purge_before_seqno: u64, drop_deletes: bool) -> Result<()> {
        let vbucket = self.vb(vbid)?;
        let shard = self.shard_for(vbid);

        let mut new_filter = if self.config().bfilter_enabled {
            Some(BloomFilter::new(
                self.config().bfilter_key_count,
                self.config().bfilter_fp_prob,
            ))
        } else {
            None
        };
        let mut expired: Vec<Item> = Vec::new();

        let result = {
            let mut surviving = |key: &[u8], deleted: bool| {
                if let Some(filter) = new_filter.as_mut() {
                    // after a drop-deletes pass the tombstone keys are gone
                    if !deleted || !drop_deletes {
                        filter.insert(key);
                    }
                }
            };
            let mut on_expired = |item: Item| expired.push(item);
            let mut ctx = CompactionCtx {
                purge_before_seqno,
                drop_deletes,
                now: unix_now(),
                surviving_key: Some(&mut surviving),
                expired: Some(&mut on_expired),
            };
            shard.store.lock().compact_db(vbid, &mut ctx)?
        };

        if result.purged_up_to > 0 {
            vbucket.set_purge_seqno(result.purged_up_to);
        }
        if new_filter.is_some() {
            vbucket.swap_bloom_filter(new_filter);
        }
        for item in expired {
            vbucket.process_expiry(&item.key, ExpirySource::Compactor);
        }
        self.stats().compactions.fetch_add(1, Ordering::Relaxed);
        self.after_mutation(vbid);
        Ok(())
    }

    // ---- persistence & traffic control ------------------------------

    /// STOP_PERSISTENCE.
    pub fn stop_persistence(&self) {
        for shard in self.shards() {
            shard.flusher().pause();
        }
    }

    /// START_PERSISTENCE.
    pub fn start_persistence(&self) {
        for shard in self.shards() {
            shard.flusher().resume();
        }
    }

    /// ENABLE_TRAFFIC: leave degraded mode.
    pub fn enable_traffic(&self) {
        self.set_traffic(true);
    }

    /// DISABLE_TRAFFIC.
    pub fn disable_traffic(&self) {
        self.set_traffic(false);
    }

    /// SET_CLUSTER_CONFIG: opaque blob stored for reconnecting clients.
    pub fn set_cluster_config(&self, blob: impl Into<Bytes>) {
        *self.cluster_config_blob().lock() = blob.into();
    }

    /// GET_CLUSTER_CONFIG.
    pub fn get_cluster_config(&self) -> Bytes {
        self.cluster_config_blob().lock().clone()
    }

    /// Drain every persistence cursor synchronously; primarily for
    /// embedders that need a known-persisted point (tests, shutdown).
    pub fn force_flush(&self) {
        loop {
            let flushed: usize = self
                .shards()
                .iter()
                .map(|shard| shard.flusher().flush_all())
                .sum();
            if flushed == 0 {
                break;
            }
        }
    }
}
