use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;

use crate::core::notifier::NotifyStatus;
use crate::error::EmberError;
use crate::tests::support::{open_store, open_store_with_notifier};
use crate::utils::time::unix_now;
use crate::{EvictionPolicy, Item, VBucketState};

#[test]
fn test_basic_set_get() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    let cas = store.set(0, b"k1", &b"v1"[..]).unwrap();
    let item = store.get(0, b"k1").unwrap();
    assert_eq!(&item.value[..], b"v1");
    assert_eq!(item.meta.cas, cas);
}

#[test]
fn test_get_unknown_vbucket_is_not_my_vbucket() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    assert!(matches!(
        store.get(9, b"k").unwrap_err(),
        EmberError::NotMyVbucket
    ));
    assert!(matches!(
        store.get(u16::MAX, b"k").unwrap_err(),
        EmberError::NotMyVbucket
    ));
}

#[test]
fn test_key_validation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    assert!(matches!(
        store.set(0, b"", &b"v"[..]).unwrap_err(),
        EmberError::InvalidKeySize
    ));
    let long_key = vec![b'x'; 251];
    assert!(matches!(
        store.set(0, &long_key, &b"v"[..]).unwrap_err(),
        EmberError::InvalidKeySize
    ));
}

#[test]
fn test_expiry_on_access_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    let item = Item::new(b"e".to_vec(), b"x".to_vec()).with_exptime(unix_now() + 1);
    store.set_item(0, item, 0, None).unwrap();
    assert!(store.get(0, b"e").is_ok());

    std::thread::sleep(Duration::from_secs(2));

    assert!(matches!(
        store.get(0, b"e").unwrap_err(),
        EmberError::KeyNotFound
    ));
    assert_eq!(store.stats().expired_access.load(Ordering::Relaxed), 1);
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.num_expired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_pending_vbucket_blocks_then_resumes() {
    let dir = TempDir::new().unwrap();
    let (store, rx) = open_store_with_notifier(dir.path(), EvictionPolicy::ValueOnly);
    store.set_vbucket_state(1, VBucketState::Pending, false).unwrap();

    let err = store
        .set_item(1, Item::new(b"p".to_vec(), b"q".to_vec()), 0, Some(42))
        .unwrap_err();
    assert!(matches!(err, EmberError::WouldBlock));

    store.set_vbucket_state(1, VBucketState::Active, false).unwrap();
    let (cookie, status) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(cookie, 42);
    assert_eq!(status, NotifyStatus::Success);

    let cas = store
        .set_item(1, Item::new(b"p".to_vec(), b"q".to_vec()), 0, Some(42))
        .unwrap();
    assert!(cas > 0);
}

#[test]
fn test_vbucket_delete_notifies_inflight_cookie_once() {
    let dir = TempDir::new().unwrap();
    let (store, rx) = open_store_with_notifier(dir.path(), EvictionPolicy::ValueOnly);
    store.set_vbucket_state(2, VBucketState::Pending, false).unwrap();

    let err = store
        .set_item(2, Item::new(b"k".to_vec(), b"v".to_vec()), 0, Some(9))
        .unwrap_err();
    assert!(matches!(err, EmberError::WouldBlock));

    store.delete_vbucket(2).unwrap();
    let (cookie, status) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(cookie, 9);
    assert_eq!(status, NotifyStatus::NotMyVbucket);
    assert!(rx.try_recv().is_err(), "exactly one notification");

    assert!(matches!(
        store.get(2, b"k").unwrap_err(),
        EmberError::NotMyVbucket
    ));
}

#[test]
fn test_observe_wire_format() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    let cas = store.set(0, b"obs", &b"v"[..]).unwrap();

    let out = store.observe(&[(0, b"obs".to_vec())]).unwrap();
    // vb(2) keylen(2) key(3) state(1) cas(8)
    assert_eq!(out.len(), 2 + 2 + 3 + 1 + 8);
    assert_eq!(u16::from_be_bytes([out[0], out[1]]), 0);
    assert_eq!(u16::from_be_bytes([out[2], out[3]]), 3);
    assert_eq!(&out[4..7], b"obs");
    assert_eq!(out[7], 0x00, "dirty means not persisted");
    assert_eq!(u64::from_be_bytes(out[8..16].try_into().unwrap()), cas);

    store.force_flush();
    let out = store.observe(&[(0, b"obs".to_vec())]).unwrap();
    assert_eq!(out[7], 0x01, "persisted after flush");

    let out = store.observe(&[(0, b"missing".to_vec())]).unwrap();
    assert_eq!(out[4 + 7], 0x80, "not found");
}

#[test]
fn test_observe_seqno_same_lineage() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    for i in 0..10 {
        store.set(0, format!("k{i}").as_bytes(), &b"v"[..]).unwrap();
    }
    store.force_flush();

    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    let uuid = vb.current_uuid();
    let out = store.observe_seqno(0, uuid).unwrap();

    assert_eq!(out[0], 0, "no failover");
    assert_eq!(u16::from_be_bytes([out[1], out[2]]), 0);
    assert_eq!(u64::from_be_bytes(out[3..11].try_into().unwrap()), uuid);
    let last_persisted = u64::from_be_bytes(out[11..19].try_into().unwrap());
    let current = u64::from_be_bytes(out[19..27].try_into().unwrap());
    assert_eq!(last_persisted, 10);
    assert_eq!(current, 10);
}

#[test]
fn test_observe_seqno_after_failover() {
    let dir = TempDir::new().unwrap();
    let old_uuid = {
        let store = open_store(dir.path());
        for i in 0..10 {
            store.set(0, format!("k{i}").as_bytes(), &b"v"[..]).unwrap();
        }
        store.force_flush();
        let uuid = store.shard_for(0).get_vbucket(0).unwrap().current_uuid();
        store.shutdown();
        uuid
    };

    let store = open_store(dir.path());
    let new_uuid = store.shard_for(0).get_vbucket(0).unwrap().current_uuid();
    assert_ne!(new_uuid, old_uuid);

    let out = store.observe_seqno(0, old_uuid).unwrap();
    assert_eq!(out[0], 1, "failover indicated");
    assert_eq!(u16::from_be_bytes([out[1], out[2]]), 0);
    assert_eq!(u64::from_be_bytes(out[3..11].try_into().unwrap()), new_uuid);
    let last_persisted = u64::from_be_bytes(out[11..19].try_into().unwrap());
    let current = u64::from_be_bytes(out[19..27].try_into().unwrap());
    assert_eq!(last_persisted, 10);
    assert_eq!(current, 10);
    let failover_uuid = u64::from_be_bytes(out[27..35].try_into().unwrap());
    let failover_seqno = u64::from_be_bytes(out[35..43].try_into().unwrap());
    assert_eq!(failover_uuid, old_uuid);
    assert_eq!(failover_seqno, 10);
}

#[test]
fn test_full_eviction_get_meta_with_bloom() {
    let dir = TempDir::new().unwrap();
    let (store, rx) = open_store_with_notifier(dir.path(), EvictionPolicy::FullEviction);

    for i in 0..10u64 {
        store.set(0, format!("key-{i}").as_bytes(), &b"v"[..]).unwrap();
    }
    store.force_flush();
    for i in 0..10 {
        store.evict_key(0, format!("key-{i}").as_bytes()).unwrap();
    }

    for i in 0..10u64 {
        match store.get_meta(0, format!("key-{i}").as_bytes(), Some(i)) {
            Err(EmberError::WouldBlock) => {
                crate::tests::support::run_bgfetcher(&store, 0);
                let (_, status) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(status, NotifyStatus::Success);
                store.get_meta(0, format!("key-{i}").as_bytes(), None).unwrap();
            }
            Ok(_) => {}
            Err(other) => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(store.stats().bg_meta_fetched.load(Ordering::Relaxed), 10);

    // a never-stored key is rejected by the filter without a disk probe
    let before = store.stats().bg_meta_fetched.load(Ordering::Relaxed)
        + store.stats().bg_fetched.load(Ordering::Relaxed);
    let err = store.get_meta(0, b"never-stored-key", None).unwrap_err();
    assert!(matches!(err, EmberError::KeyNotFound));
    let after = store.stats().bg_meta_fetched.load(Ordering::Relaxed)
        + store.stats().bg_fetched.load(Ordering::Relaxed);
    assert_eq!(before, after);
    assert!(store.stats().bloom_skipped_fetches.load(Ordering::Relaxed) >= 1);
}

#[test]
fn test_get_keys_bounded_range_scan() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    for key in ["apple", "banana", "cherry", "date", "elderberry"] {
        store.set(0, key.as_bytes(), &b"v"[..]).unwrap();
    }
    store.delete(0, b"cherry", 0, None).unwrap();
    store.force_flush();

    let keys = store.get_keys(0, b"banana", 10).unwrap();
    assert_eq!(
        keys,
        vec![b"banana".to_vec(), b"date".to_vec(), b"elderberry".to_vec()]
    );

    let keys = store.get_keys(0, b"", 2).unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], b"apple".to_vec());
}

#[test]
fn test_get_random_key() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    assert!(matches!(
        store.get_random_key().unwrap_err(),
        EmberError::KeyNotFound
    ));

    store.set(0, b"only", &b"v"[..]).unwrap();
    assert_eq!(store.get_random_key().unwrap(), b"only");
}

#[test]
fn test_get_all_vb_seqnos_filtered_by_state() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    store.set_vbucket_state(1, VBucketState::Replica, false).unwrap();
    store.set(0, b"k", &b"v"[..]).unwrap();

    let all = store.get_all_vb_seqnos(None);
    assert_eq!(all.len(), 2);
    assert!(all.contains(&(0, 1)));
    assert!(all.contains(&(1, 0)));

    let active = store.get_all_vb_seqnos(Some(VBucketState::Active));
    assert_eq!(active, vec![(0, 1)]);
}

#[test]
fn test_cluster_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    assert!(store.get_cluster_config().is_empty());

    store.set_cluster_config(&b"{\"rev\": 7}"[..]);
    assert_eq!(&store.get_cluster_config()[..], b"{\"rev\": 7}");
}

#[test]
fn test_traffic_control_gates_writes_not_reads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    store.set(0, b"k", &b"v"[..]).unwrap();

    store.disable_traffic();
    assert!(matches!(
        store.set(0, b"k2", &b"v"[..]).unwrap_err(),
        EmberError::TempFail
    ));
    assert!(store.get(0, b"k").is_ok(), "reads pass in degraded mode");

    store.enable_traffic();
    store.set(0, b"k2", &b"v"[..]).unwrap();
}

#[test]
fn test_compaction_advances_purge_seqno_idempotently() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    store.set(0, b"doomed", &b"v"[..]).unwrap();
    store.set(0, b"kept", &b"v"[..]).unwrap();
    store.force_flush();
    store.delete(0, b"doomed", 0, None).unwrap();
    store.set(0, b"kept", &b"v2"[..]).unwrap();
    store.force_flush();

    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.purge_seqno(), 0);

    store.compact_db(0, u64::MAX, true).unwrap();
    let purge_after_first = vb.purge_seqno();
    assert!(purge_after_first > 0);

    // identical second run with no intervening mutations changes nothing
    store.compact_db(0, u64::MAX, true).unwrap();
    assert_eq!(vb.purge_seqno(), purge_after_first);

    // invariant: high >= last_persisted >= purge
    assert!(vb.high_seqno() >= vb.last_persisted_seqno());
    assert!(vb.last_persisted_seqno() >= vb.purge_seqno());
}

#[test]
fn test_stop_start_persistence_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    store.stop_persistence();
    // let any in-flight flusher slice finish before queueing the write
    std::thread::sleep(Duration::from_millis(300));
    store.set(0, b"k", &b"v"[..]).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(store.stats().total_persisted.load(Ordering::Relaxed), 0);

    store.start_persistence();
    store.force_flush();
    assert_eq!(store.stats().total_persisted.load(Ordering::Relaxed), 1);
}

#[test]
fn test_stats_snapshot_formats() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());
    store.set(0, b"k", &b"v"[..]).unwrap();
    store.get(0, b"k").unwrap();

    let snapshot = store.snapshot_stats();
    assert_eq!(snapshot.num_sets, 1);
    assert_eq!(snapshot.num_gets, 1);
    let text = snapshot.format();
    assert!(text.contains("Operations"));
    assert!(text.contains("Warmup"));
}
