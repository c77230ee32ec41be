use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::constants::{INITIAL_NRU, MAX_NRU};
use crate::core::hash_table::{HashTableVisitor, VisitAction};
use crate::core::store::StoreBuilder;
use crate::core::stored_value::StoredValue;
use crate::core::vbucket::{ExpirySource, VBucketState};
use crate::executor::task::{GlobalTask, TaskHandle};
use crate::tasks::expiry_pager::ExpiryPagerTask;
use crate::tasks::item_pager::ItemPagerTask;
use crate::utils::time::unix_now;
use crate::Item;

fn run_task(task: impl GlobalTask + 'static) {
    let handle = TaskHandle::new(u64::MAX, Box::new(task), Instant::now());
    handle.task.run(&handle);
}

#[test]
fn test_item_pager_reclaims_below_low_watermark() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path())
        .max_num_shards(1)
        .max_vbuckets(4)
        // tiny quota so a handful of items crosses the watermarks
        .max_size(512 * 1024)
        .mem_high_wat(96 * 1024)
        .mem_low_wat(48 * 1024)
        .build()
        .unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();

    for i in 0..200 {
        store
            .set(0, format!("key-{i}").as_bytes(), vec![0u8; 1024])
            .unwrap();
    }
    // clean items are the only eviction candidates
    store.force_flush();
    assert!(store.stats().mem_used() > store.mem_high_wat());

    // age everything to eviction eligibility, then reclaim
    let weak = Arc::downgrade(&store);
    for _ in 0..=(MAX_NRU - INITIAL_NRU) as usize + 1 {
        run_task(ItemPagerTask::new(weak.clone()));
    }

    assert!(
        store.stats().mem_used() <= store.mem_high_wat(),
        "pager failed to reclaim: {} used",
        store.stats().mem_used()
    );
    assert!(store.stats().num_value_ejects.load(Ordering::Relaxed) > 0);
    assert!(store.stats().pager_runs.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_item_pager_noop_below_high_watermark() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path())
        .max_num_shards(1)
        .build()
        .unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
    store.set(0, b"k", &b"v"[..]).unwrap();
    store.force_flush();

    let weak = Arc::downgrade(&store);
    run_task(ItemPagerTask::new(weak));
    assert_eq!(store.stats().pager_runs.load(Ordering::Relaxed), 0);
    assert!(store.get(0, b"k").is_ok());
}

#[test]
fn test_dirty_items_survive_paging() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path())
        .max_num_shards(1)
        .max_size(256 * 1024)
        .mem_high_wat(8 * 1024)
        .mem_low_wat(4 * 1024)
        .build()
        .unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
    store.stop_persistence();

    for i in 0..20 {
        store
            .set(0, format!("key-{i}").as_bytes(), vec![0u8; 512])
            .unwrap();
    }

    // everything is dirty (persistence stopped): nothing may be ejected
    let weak = Arc::downgrade(&store);
    for _ in 0..5 {
        run_task(ItemPagerTask::new(weak.clone()));
    }
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.ht.counters.num_non_resident.load(Ordering::Acquire), 0);
}

struct NruProbe {
    nru_values: Vec<u8>,
}

impl HashTableVisitor for NruProbe {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction {
        self.nru_values.push(sv.nru);
        VisitAction::Keep
    }
}

#[test]
fn test_access_resets_nru_age() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path()).max_num_shards(1).build().unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();

    store.set(0, b"touched", &b"v"[..]).unwrap();
    store.get(0, b"touched").unwrap();

    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    let mut probe = NruProbe { nru_values: Vec::new() };
    vb.ht.visit(&mut probe);
    assert_eq!(probe.nru_values, vec![0], "a read resets the NRU age");
}

#[test]
fn test_expiry_pager_tombstones_expired_documents() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path()).max_num_shards(1).build().unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();

    let past = unix_now().saturating_sub(5);
    for i in 0..5 {
        let item = Item::new(format!("stale-{i}").into_bytes(), b"v".to_vec())
            .with_exptime(past);
        store.set_item(0, item, 0, None).unwrap();
    }
    store.set(0, b"fresh", &b"v"[..]).unwrap();

    let weak = Arc::downgrade(&store);
    run_task(ExpiryPagerTask::new(weak, Duration::from_secs(3600)));

    assert_eq!(store.stats().expired_pager.load(Ordering::Relaxed), 5);
    assert_eq!(store.stats().expiry_pager_runs.load(Ordering::Relaxed), 1);
    assert!(store.get(0, b"fresh").is_ok());
    for i in 0..5 {
        assert!(store.get(0, format!("stale-{i}").as_bytes()).is_err());
    }
    // each expiry produced a tombstone revision
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.high_seqno(), 6 + 5);
}

#[test]
fn test_expiry_counters_by_source() {
    let dir = TempDir::new().unwrap();
    let store = StoreBuilder::new(dir.path()).max_num_shards(1).build().unwrap();
    store.set_vbucket_state(0, VBucketState::Active, false).unwrap();

    let past = unix_now().saturating_sub(5);
    let item = Item::new(b"a".to_vec(), b"v".to_vec()).with_exptime(past);
    store.set_item(0, item, 0, None).unwrap();
    let item = Item::new(b"b".to_vec(), b"v".to_vec()).with_exptime(past);
    store.set_item(0, item, 0, None).unwrap();

    // one observed by access, one by an explicit compactor-style delete
    assert!(store.get(0, b"a").is_err());
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    vb.process_expiry(b"b", ExpirySource::Compactor);

    assert_eq!(store.stats().expired_access.load(Ordering::Relaxed), 1);
    assert_eq!(store.stats().expired_compactor.load(Ordering::Relaxed), 1);
    assert_eq!(store.stats().expired_pager.load(Ordering::Relaxed), 0);
}
