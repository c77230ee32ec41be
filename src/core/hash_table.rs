use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::constants::{DATATYPE_MASK, HT_MAX_LOAD_FACTOR, HT_PRIME_SIZES};
use crate::core::item::Item;
use crate::core::stored_value::StoredValue;
use crate::stats::{sub_guarded, Statistics};
use crate::utils::hash::hash_key;

/// How non-resident items are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Eject the value blob, keep the metadata chained.
    ValueOnly,
    /// Unlink the whole record; the document survives only on disk.
    FullEviction,
}

#[derive(Debug, Default)]
pub struct HtCounters {
    /// Live documents present in the table (excludes tombstones and temps).
    pub num_items: AtomicUsize,
    /// Subset of `num_items` whose value blob is not in memory.
    pub num_non_resident: AtomicUsize,
    pub num_deleted: AtomicUsize,
    pub num_temp: AtomicUsize,
    /// Live documents including those resident only on disk under full
    /// eviction. Maintained by the vbucket, seeded by warmup.
    pub num_total_items: AtomicUsize,
    /// Bytes attributed to chained records.
    pub mem_size: AtomicUsize,
    pub datatype_counts: [AtomicUsize; 8],
    pub max_depth: AtomicUsize,
    pub num_resizes: AtomicU64,
}

/// Counter-relevant facts about a stored value, captured before and after an
/// in-place mutation so the deltas can be applied once.
#[derive(Debug, Clone, Copy)]
struct SvStat {
    deleted: bool,
    temp: bool,
    resident: bool,
    datatype: u8,
    size: usize,
}

impl SvStat {
    fn of(sv: &StoredValue) -> Self {
        Self {
            deleted: sv.deleted,
            temp: sv.temp,
            resident: sv.resident,
            datatype: sv.datatype,
            size: sv.size(),
        }
    }
}

struct Stripe {
    chains: Vec<Option<Box<StoredValue>>>,
}

/// Per-vbucket concurrent index of stored values.
///
/// A dense array of `size` hash buckets is guarded by `L` stripe mutexes;
/// stripe `s` owns every bucket `b` with `b % L == s`. Callers take a
/// [`HashBucketLock`] covering one bucket and perform all reads and
/// mutations through it; resize takes every stripe.
pub struct HashTable {
    policy: EvictionPolicy,
    stripes: Vec<CachePadded<Mutex<Stripe>>>,
    num_buckets: AtomicUsize,
    resize_lock: Mutex<()>,
    visitors: Mutex<usize>,
    visitors_cv: Condvar,
    pub counters: HtCounters,
    stats: Arc<Statistics>,
}

/// Scoped lock over one hash bucket. All mutations release their counters
/// through this guard, so no stored value is observable half-updated.
pub struct HashBucketLock<'a> {
    ht: &'a HashTable,
    guard: MutexGuard<'a, Stripe>,
    local: usize,
}

/// Decision returned by a visitor for each stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    Keep,
    /// Drop the value blob, keep metadata (value eviction).
    EjectValue,
    /// Unlink the record entirely (full eviction).
    EjectItem,
}

pub trait HashTableVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction;

    /// Polled between hash chains; returning false pauses the walk.
    fn should_continue(&mut self) -> bool {
        true
    }
}

/// Resumption point for a paused visit. If the table was resized since the
/// position was taken, visitation restarts from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub ht_size: usize,
    pub stripe: usize,
    pub chain: usize,
}

impl Position {
    pub fn begin() -> Self {
        Self {
            ht_size: 0,
            stripe: 0,
            chain: 0,
        }
    }

    pub fn is_end(&self, num_stripes: usize) -> bool {
        self.ht_size != 0 && self.stripe >= num_stripes
    }
}

fn advance(slot: &mut Option<Box<StoredValue>>) -> &mut Option<Box<StoredValue>> {
    &mut slot.as_mut().expect("walked past end of hash chain").next
}

fn chain_find_idx(slot: &Option<Box<StoredValue>>, key: &[u8]) -> Option<usize> {
    let mut cur = slot.as_deref();
    let mut idx = 0;
    while let Some(sv) = cur {
        if sv.key == key {
            return Some(idx);
        }
        idx += 1;
        cur = sv.next.as_deref();
    }
    None
}

fn chain_slot_nth(slot: &mut Option<Box<StoredValue>>, idx: usize) -> &mut Option<Box<StoredValue>> {
    let mut cur = slot;
    for _ in 0..idx {
        cur = advance(cur);
    }
    cur
}

fn chain_depth(slot: &Option<Box<StoredValue>>) -> usize {
    let mut depth = 0;
    let mut cur = slot.as_deref();
    while let Some(sv) = cur {
        depth += 1;
        cur = sv.next.as_deref();
    }
    depth
}

impl HashTable {
    pub fn new(
        initial_size: usize,
        num_locks: usize,
        policy: EvictionPolicy,
        stats: Arc<Statistics>,
    ) -> Self {
        let size = initial_size.max(1);
        let locks = num_locks.max(1).min(size);
        let per_stripe = size.div_ceil(locks);

        let stripes = (0..locks)
            .map(|_| {
                let mut chains = Vec::with_capacity(per_stripe);
                chains.resize_with(per_stripe, || None);
                CachePadded::new(Mutex::new(Stripe { chains }))
            })
            .collect();

        Self {
            policy,
            stripes,
            num_buckets: AtomicUsize::new(size),
            resize_lock: Mutex::new(()),
            visitors: Mutex::new(0),
            visitors_cv: Condvar::new(),
            counters: HtCounters::default(),
            stats,
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn size(&self) -> usize {
        self.num_buckets.load(Ordering::Acquire)
    }

    pub fn num_locks(&self) -> usize {
        self.stripes.len()
    }

    pub fn num_items(&self) -> usize {
        self.counters.num_items.load(Ordering::Acquire)
    }

    pub fn mem_size(&self) -> usize {
        self.counters.mem_size.load(Ordering::Acquire)
    }

    /// Take the lock covering `key`'s hash bucket. Loops if a resize swaps
    /// the bucket geometry between computing the bucket and acquiring the
    /// stripe.
    pub fn lock_key(&self, key: &[u8]) -> HashBucketLock<'_> {
        let h = hash_key(key) as usize;
        loop {
            let size = self.num_buckets.load(Ordering::Acquire);
            let bucket = h % size;
            let stripe = bucket % self.stripes.len();
            let guard = self.stripes[stripe].lock();
            if self.num_buckets.load(Ordering::Acquire) == size {
                return HashBucketLock {
                    ht: self,
                    guard,
                    local: bucket / self.stripes.len(),
                };
            }
        }
    }

    /// Locked find; resets the NRU age when `track_reference` is set.
    pub fn find(
        &self,
        key: &[u8],
        track_reference: bool,
        wants_deleted: bool,
    ) -> Option<Item> {
        let mut lock = self.lock_key(key);
        let sv = lock.find(key, wants_deleted, track_reference)?;
        Some(sv.to_item())
    }

    /// The preferred size for the current item count, if it differs from
    /// the current size.
    pub fn needs_resize(&self) -> Option<usize> {
        let items = self.num_items();
        let size = self.size();
        let preferred = Self::preferred_size(items);
        if preferred > size || preferred * HT_MAX_LOAD_FACTOR < size {
            Some(preferred)
        } else {
            None
        }
    }

    fn preferred_size(items: usize) -> usize {
        for p in HT_PRIME_SIZES {
            if items < p * HT_MAX_LOAD_FACTOR {
                return p;
            }
        }
        *HT_PRIME_SIZES.last().expect("prime ladder is non-empty")
    }

    /// Swap the bucket array for one sized `to` (or the preferred size).
    ///
    /// Waits for in-flight visitors to drain, then takes every stripe; no
    /// item is lost or duplicated across the swap.
    pub fn resize(&self, to: Option<usize>) {
        let _serialize = self.resize_lock.lock();

        {
            let mut visitors = self.visitors.lock();
            while *visitors > 0 {
                self.visitors_cv.wait(&mut visitors);
            }
        }

        let old_size = self.size();
        let new_size = to.unwrap_or_else(|| Self::preferred_size(self.num_items())).max(1);
        if new_size == old_size {
            return;
        }

        let mut guards: Vec<MutexGuard<'_, Stripe>> =
            self.stripes.iter().map(|s| s.lock()).collect();

        let mut detached = Vec::new();
        for guard in guards.iter_mut() {
            for chain in guard.chains.iter_mut() {
                let mut cur = chain.take();
                while let Some(mut sv) = cur {
                    cur = sv.next.take();
                    detached.push(sv);
                }
            }
        }

        let locks = self.stripes.len();
        let per_stripe = new_size.div_ceil(locks);
        for guard in guards.iter_mut() {
            guard.chains.clear();
            guard.chains.resize_with(per_stripe, || None);
        }
        self.num_buckets.store(new_size, Ordering::Release);

        for mut sv in detached {
            let bucket = hash_key(&sv.key) as usize % new_size;
            let chain = &mut guards[bucket % locks].chains[bucket / locks];
            sv.next = chain.take();
            *chain = Some(sv);
        }

        self.counters.num_resizes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(old_size, new_size, "hash table resized");
    }

    /// Walk the whole table, honoring visitor actions. Each call to the
    /// paused walk advances at least one chain, so this terminates even
    /// for visitors that request frequent pauses.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        let mut pos = Position::begin();
        loop {
            pos = self.pause_resume_visit(visitor, pos);
            if pos.is_end(self.stripes.len()) {
                break;
            }
        }
    }

    /// Visit from `pos`, stopping when the visitor declines to continue.
    /// Returns the position to resume from; if the table was resized since
    /// `pos` was taken, the walk restarts from the beginning.
    pub fn pause_resume_visit(
        &self,
        visitor: &mut dyn HashTableVisitor,
        pos: Position,
    ) -> Position {
        {
            let mut visitors = self.visitors.lock();
            *visitors += 1;
        }
        let result = self.do_visit(visitor, pos);
        {
            let mut visitors = self.visitors.lock();
            *visitors -= 1;
            if *visitors == 0 {
                self.visitors_cv.notify_all();
            }
        }
        result
    }

    fn do_visit(&self, visitor: &mut dyn HashTableVisitor, pos: Position) -> Position {
        let size = self.size();
        let locks = self.stripes.len();
        let mut pos = if pos.ht_size != size {
            Position {
                ht_size: size,
                stripe: 0,
                chain: 0,
            }
        } else {
            pos
        };

        while pos.stripe < locks {
            let mut guard = self.stripes[pos.stripe].lock();
            if self.size() != size {
                // resized while between stripes; restart on the next call
                return Position {
                    ht_size: self.size(),
                    stripe: 0,
                    chain: 0,
                };
            }
            let num_chains = guard.chains.len();
            while pos.chain < num_chains {
                self.visit_chain(&mut guard, pos.chain, visitor);
                pos.chain += 1;
                if !visitor.should_continue() {
                    drop(guard);
                    return pos;
                }
            }
            pos.stripe += 1;
            pos.chain = 0;
        }
        pos
    }

    fn visit_chain(&self, stripe: &mut Stripe, chain: usize, visitor: &mut dyn HashTableVisitor) {
        let now = Instant::now();
        let mut slot: &mut Option<Box<StoredValue>> = &mut stripe.chains[chain];
        loop {
            let action = match slot.as_deref_mut() {
                None => break,
                Some(sv) => {
                    let requested = visitor.visit(sv);
                    self.vet_action(sv, requested, now)
                }
            };
            match action {
                VisitAction::Keep => {
                    slot = advance(slot);
                }
                VisitAction::EjectValue => {
                    let sv = slot.as_deref_mut().expect("chain slot vanished");
                    let before = SvStat::of(sv);
                    let released = sv.eject_value();
                    self.note_transition(before, SvStat::of(sv));
                    self.stats
                        .num_value_ejects
                        .fetch_add(1, Ordering::Relaxed);
                    debug_assert!(released > 0 || sv.value.is_none());
                    slot = advance(slot);
                }
                VisitAction::EjectItem => {
                    let mut removed = slot.take().expect("chain slot vanished");
                    *slot = removed.next.take();
                    self.note_remove(&removed);
                    self.stats
                        .num_value_ejects
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Dirty, locked and temp items are never ejected; full-item ejection
    /// is only meaningful under the full-eviction policy.
    fn vet_action(&self, sv: &StoredValue, action: VisitAction, now: Instant) -> VisitAction {
        match action {
            VisitAction::Keep => VisitAction::Keep,
            _ if sv.dirty || sv.is_locked(now) || sv.temp || sv.deleted => {
                self.stats
                    .num_eject_failures
                    .fetch_add(1, Ordering::Relaxed);
                VisitAction::Keep
            }
            VisitAction::EjectValue if !sv.resident => VisitAction::Keep,
            VisitAction::EjectValue => VisitAction::EjectValue,
            VisitAction::EjectItem if self.policy == EvictionPolicy::FullEviction => {
                VisitAction::EjectItem
            }
            VisitAction::EjectItem if sv.resident => VisitAction::EjectValue,
            VisitAction::EjectItem => VisitAction::Keep,
        }
    }

    /// Counter plumbing shared by the bucket-lock guard and visitors.
    fn note_insert(&self, sv: &StoredValue) {
        if sv.temp {
            self.counters.num_temp.fetch_add(1, Ordering::AcqRel);
        } else if sv.deleted {
            self.counters.num_deleted.fetch_add(1, Ordering::AcqRel);
        } else {
            self.counters.num_items.fetch_add(1, Ordering::AcqRel);
            if !sv.resident {
                self.counters.num_non_resident.fetch_add(1, Ordering::AcqRel);
            }
            self.counters.datatype_counts[(sv.datatype & DATATYPE_MASK) as usize]
                .fetch_add(1, Ordering::AcqRel);
        }
        let size = sv.size();
        self.counters.mem_size.fetch_add(size, Ordering::AcqRel);
        self.stats.add_mem_used(size);
    }

    fn note_remove(&self, sv: &StoredValue) {
        if sv.temp {
            sub_guarded(&self.counters.num_temp, 1, "ht_num_temp");
        } else if sv.deleted {
            sub_guarded(&self.counters.num_deleted, 1, "ht_num_deleted");
        } else {
            sub_guarded(&self.counters.num_items, 1, "ht_num_items");
            if !sv.resident {
                sub_guarded(&self.counters.num_non_resident, 1, "ht_num_non_resident");
            }
            sub_guarded(
                &self.counters.datatype_counts[(sv.datatype & DATATYPE_MASK) as usize],
                1,
                "ht_datatype",
            );
        }
        let size = sv.size();
        sub_guarded(&self.counters.mem_size, size, "ht_mem_size");
        self.stats.sub_mem_used(size);
    }

    fn note_transition(&self, before: SvStat, after: SvStat) {
        self.note_remove_stat(before);
        self.note_insert_stat(after);
    }

    fn note_insert_stat(&self, s: SvStat) {
        if s.temp {
            self.counters.num_temp.fetch_add(1, Ordering::AcqRel);
        } else if s.deleted {
            self.counters.num_deleted.fetch_add(1, Ordering::AcqRel);
        } else {
            self.counters.num_items.fetch_add(1, Ordering::AcqRel);
            if !s.resident {
                self.counters.num_non_resident.fetch_add(1, Ordering::AcqRel);
            }
            self.counters.datatype_counts[(s.datatype & DATATYPE_MASK) as usize]
                .fetch_add(1, Ordering::AcqRel);
        }
        self.counters.mem_size.fetch_add(s.size, Ordering::AcqRel);
        self.stats.add_mem_used(s.size);
    }

    fn note_remove_stat(&self, s: SvStat) {
        if s.temp {
            sub_guarded(&self.counters.num_temp, 1, "ht_num_temp");
        } else if s.deleted {
            sub_guarded(&self.counters.num_deleted, 1, "ht_num_deleted");
        } else {
            sub_guarded(&self.counters.num_items, 1, "ht_num_items");
            if !s.resident {
                sub_guarded(&self.counters.num_non_resident, 1, "ht_num_non_resident");
            }
            sub_guarded(
                &self.counters.datatype_counts[(s.datatype & DATATYPE_MASK) as usize],
                1,
                "ht_datatype",
            );
        }
        sub_guarded(&self.counters.mem_size, s.size, "ht_mem_size");
        self.stats.sub_mem_used(s.size);
    }

    /// Remove every record and reset the counters; used when a vbucket is
    /// torn down.
    pub fn clear(&self) {
        let _serialize = self.resize_lock.lock();
        let mut guards: Vec<MutexGuard<'_, Stripe>> =
            self.stripes.iter().map(|s| s.lock()).collect();
        for guard in guards.iter_mut() {
            for chain in guard.chains.iter_mut() {
                let mut cur = chain.take();
                while let Some(mut sv) = cur {
                    cur = sv.next.take();
                    self.note_remove(&sv);
                }
            }
        }
    }

    /// Uniformly-ish sampled live key, if the table has any.
    pub fn random_key(&self, seed: usize) -> Option<Vec<u8>> {
        let locks = self.stripes.len();
        for offset in 0..locks {
            let guard = self.stripes[(seed + offset) % locks].lock();
            for chain in guard.chains.iter() {
                let mut cur = chain.as_deref();
                while let Some(sv) = cur {
                    if !sv.deleted && !sv.temp {
                        return Some(sv.key.clone());
                    }
                    cur = sv.next.as_deref();
                }
            }
        }
        None
    }
}

impl<'a> HashBucketLock<'a> {
    /// Find `key` in the locked bucket. Tombstones are only surfaced when
    /// `wants_deleted` is set; `track_reference` resets the NRU age.
    pub fn find(
        &mut self,
        key: &[u8],
        wants_deleted: bool,
        track_reference: bool,
    ) -> Option<&mut StoredValue> {
        let idx = chain_find_idx(&self.guard.chains[self.local], key)?;
        let sv = chain_slot_nth(&mut self.guard.chains[self.local], idx)
            .as_deref_mut()
            .expect("indexed chain slot is occupied");
        if sv.deleted && !wants_deleted {
            return None;
        }
        if track_reference && !sv.deleted {
            sv.nru = 0;
        }
        Some(sv)
    }

    /// Insert a record whose key is not present in the bucket.
    pub fn insert(&mut self, mut sv: Box<StoredValue>) -> &mut StoredValue {
        debug_assert!(chain_find_idx(&self.guard.chains[self.local], &sv.key).is_none());
        self.ht.note_insert(&sv);
        let chain = &mut self.guard.chains[self.local];
        sv.next = chain.take();
        *chain = Some(sv);

        let depth = chain_depth(chain);
        self.ht.counters.max_depth.fetch_max(depth, Ordering::Relaxed);

        chain.as_deref_mut().expect("freshly inserted chain head")
    }

    /// Mutate the record for `key` in place; counter deltas are applied
    /// from a before/after snapshot.
    pub fn mutate<R>(
        &mut self,
        key: &[u8],
        f: impl FnOnce(&mut StoredValue) -> R,
    ) -> Option<R> {
        let idx = chain_find_idx(&self.guard.chains[self.local], key)?;
        let sv = chain_slot_nth(&mut self.guard.chains[self.local], idx)
            .as_deref_mut()
            .expect("indexed chain slot is occupied");
        let before = SvStat::of(sv);
        let result = f(sv);
        let after = SvStat::of(sv);
        self.ht.note_transition(before, after);
        Some(result)
    }

    /// Unlink `key` and hand its owning box to the caller, who takes over
    /// destruction. Counters are settled here so a dropped box cannot
    /// drift them.
    pub fn release(&mut self, key: &[u8]) -> Option<Box<StoredValue>> {
        let idx = chain_find_idx(&self.guard.chains[self.local], key)?;
        let slot = chain_slot_nth(&mut self.guard.chains[self.local], idx);
        let mut removed = slot.take().expect("indexed chain slot is occupied");
        *slot = removed.next.take();
        self.ht.note_remove(&removed);
        Some(removed)
    }

    /// Eject `key` under the table's eviction policy. Dirty, locked, temp
    /// and tombstoned records refuse ejection.
    pub fn eject(&mut self, key: &[u8]) -> bool {
        let now = Instant::now();
        let policy = self.ht.policy;
        let Some(idx) = chain_find_idx(&self.guard.chains[self.local], key) else {
            return false;
        };
        let slot = chain_slot_nth(&mut self.guard.chains[self.local], idx);
        let sv = slot.as_deref_mut().expect("indexed chain slot is occupied");
        if sv.dirty || sv.is_locked(now) || sv.temp || sv.deleted || !sv.resident {
            self.ht
                .stats
                .num_eject_failures
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match policy {
            EvictionPolicy::ValueOnly => {
                let before = SvStat::of(sv);
                sv.eject_value();
                let after = SvStat::of(sv);
                self.ht.note_transition(before, after);
            }
            EvictionPolicy::FullEviction => {
                let mut removed = slot.take().expect("indexed chain slot is occupied");
                *slot = removed.next.take();
                self.ht.note_remove(&removed);
            }
        }
        self.ht.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Reattach a background-fetched value to its non-resident record.
    pub fn restore_value(&mut self, item: &Item) -> bool {
        self.mutate(&item.key, |sv| {
            if sv.is_resident() {
                return false;
            }
            sv.restore_value(item);
            true
        })
        .unwrap_or(false)
    }

    /// Fill a temp placeholder with fetched metadata.
    pub fn restore_meta(&mut self, item: &Item) -> bool {
        self.mutate(&item.key, |sv| {
            if !sv.temp {
                return false;
            }
            sv.restore_meta(item);
            true
        })
        .unwrap_or(false)
    }
}
