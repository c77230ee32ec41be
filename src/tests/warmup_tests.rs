use std::sync::atomic::Ordering;

use tempfile::TempDir;

use crate::core::store::StoreBuilder;
use crate::error::EmberError;
use crate::tests::support::open_store;
use crate::{EvictionPolicy, Item, VBucketState};

#[test]
fn test_restart_restores_documents() {
    let dir = TempDir::new().unwrap();
    let (first_uuid, cas_map): (u64, Vec<(String, u64)>) = {
        let store = open_store(dir.path());
        let mut cas_map = Vec::new();
        for i in 0..100 {
            let key = format!("key-{i}");
            let cas = store.set(0, key.as_bytes(), &b"somevalue"[..]).unwrap();
            cas_map.push((key, cas));
        }
        store.force_flush();
        assert_eq!(store.stats().total_persisted.load(Ordering::Relaxed), 100);
        let uuid = store.shard_for(0).get_vbucket(0).unwrap().current_uuid();
        store.shutdown();
        (uuid, cas_map)
    };

    let store = open_store(dir.path());
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.state(), VBucketState::Active);
    assert_eq!(vb.high_seqno(), 100);
    assert_eq!(vb.last_persisted_seqno(), 100);
    assert_ne!(vb.current_uuid(), first_uuid, "restart breaks the lineage");

    let item = store.get(0, b"key-42").unwrap();
    assert_eq!(&item.value[..], b"somevalue");

    // per-document metadata survives byte for byte
    for (key, cas) in cas_map {
        let item = store.get(0, key.as_bytes()).unwrap();
        assert_eq!(item.meta.cas, cas, "{key}");
        assert_eq!(item.meta.rev_seqno, 1);
    }
    assert!(store.stats().warmup_value_count.load(Ordering::Relaxed) >= 100);
}

#[test]
fn test_restart_preserves_flags_exptime_datatype() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        let item = Item::new(b"doc".to_vec(), b"{}".to_vec())
            .with_flags(0xabad1dea)
            .with_exptime(u32::MAX)
            .with_datatype(crate::constants::DATATYPE_JSON);
        store.set_item(0, item, 0, None).unwrap();
        store.force_flush();
        store.shutdown();
    }

    let store = open_store(dir.path());
    let item = store.get(0, b"doc").unwrap();
    assert_eq!(item.meta.flags, 0xabad1dea);
    assert_eq!(item.meta.exptime, u32::MAX);
    assert_eq!(item.datatype, crate::constants::DATATYPE_JSON);
}

#[test]
fn test_restart_does_not_resurrect_deletes() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        store.set(0, b"keep", &b"v"[..]).unwrap();
        store.set(0, b"drop", &b"v"[..]).unwrap();
        store.force_flush();
        store.delete(0, b"drop", 0, None).unwrap();
        store.force_flush();
        store.shutdown();
    }

    let store = open_store(dir.path());
    assert!(store.get(0, b"keep").is_ok());
    assert!(matches!(
        store.get(0, b"drop").unwrap_err(),
        EmberError::KeyNotFound
    ));
}

#[test]
fn test_unflushed_mutations_are_lost_on_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        // park the scheduled flusher; force_flush drives the disk write
        // directly so only the first document hits the file
        store.stop_persistence();
        store.set(0, b"flushed", &b"v"[..]).unwrap();
        store.force_flush();
        store.set(0, b"volatile", &b"v"[..]).unwrap();
        store.shutdown();
    }

    let store = open_store(dir.path());
    assert!(store.get(0, b"flushed").is_ok());
    assert!(store.get(0, b"volatile").is_err(), "persistence is asynchronous");
}

#[test]
fn test_full_eviction_warmup_restores_population() {
    let dir = TempDir::new().unwrap();
    {
        let store = StoreBuilder::new(dir.path())
            .max_num_shards(1)
            .eviction_policy(EvictionPolicy::FullEviction)
            .build()
            .unwrap();
        store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
        for i in 0..50 {
            store.set(0, format!("key-{i}").as_bytes(), &b"v"[..]).unwrap();
        }
        store.force_flush();
        store.shutdown();
    }

    let store = StoreBuilder::new(dir.path())
        .max_num_shards(1)
        .eviction_policy(EvictionPolicy::FullEviction)
        .build()
        .unwrap();
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    // the on-disk population is known even before documents are resident
    assert_eq!(vb.ht.counters.num_total_items.load(Ordering::Acquire), 50);
    assert_eq!(store.get(0, b"key-7").ok().map(|i| i.value.to_vec()),
               Some(b"v".to_vec()));
}

#[test]
fn test_warmup_oom_enters_degraded_mode() {
    let dir = TempDir::new().unwrap();
    {
        let store = StoreBuilder::new(dir.path())
            .max_num_shards(1)
            .build()
            .unwrap();
        store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
        for i in 0..100 {
            store
                .set(0, format!("key-{i}").as_bytes(), vec![0u8; 4096])
                .unwrap();
        }
        store.force_flush();
        store.shutdown();
    }

    // reopen with a quota far below the data set
    let store = StoreBuilder::new(dir.path())
        .max_num_shards(1)
        .max_size(64 * 1024)
        .build()
        .unwrap();
    assert_eq!(store.stats().warmup_oom.load(Ordering::Relaxed), 1);

    // degraded mode: writes bounce until traffic is explicitly enabled
    let err = store.set(0, b"new", &b"v"[..]).unwrap_err();
    assert!(matches!(err, EmberError::TempFail));

    store.enable_traffic();
    let err = store.set(0, b"new", &b"v"[..]).unwrap_err();
    assert!(matches!(err, EmberError::NoMemory), "quota is genuinely full");
}

#[test]
fn test_reopened_store_continues_seqnos_and_cas() {
    let dir = TempDir::new().unwrap();
    let (old_high, old_cas) = {
        let store = open_store(dir.path());
        let mut cas = 0;
        for i in 0..10 {
            cas = store.set(0, format!("k{i}").as_bytes(), &b"v"[..]).unwrap();
        }
        store.force_flush();
        store.shutdown();
        (10u64, cas)
    };

    let store = open_store(dir.path());
    let new_cas = store.set(0, b"post-restart", &b"v"[..]).unwrap();
    let vb = store.shard_for(0).get_vbucket(0).unwrap();
    assert_eq!(vb.high_seqno(), old_high + 1);
    assert!(new_cas > old_cas, "CAS is monotonic across restarts");
}
