use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::core::hash_table::{
    EvictionPolicy, HashTable, HashTableVisitor, Position, VisitAction,
};
use crate::core::item::Item;
use crate::core::stored_value::StoredValue;
use crate::stats::Statistics;

fn table(policy: EvictionPolicy) -> HashTable {
    HashTable::new(23, 4, policy, Arc::new(Statistics::new()))
}

fn insert_kv(ht: &HashTable, key: &[u8], value: &[u8]) {
    let item = Item::new(key.to_vec(), value.to_vec());
    let mut guard = ht.lock_key(key);
    guard.insert(StoredValue::from_item(&item));
}

#[test]
fn test_insert_find_release() {
    let ht = table(EvictionPolicy::ValueOnly);

    insert_kv(&ht, b"alpha", b"one");
    insert_kv(&ht, b"beta", b"two");
    assert_eq!(ht.num_items(), 2);

    let found = ht.find(b"alpha", false, false).unwrap();
    assert_eq!(&found.value[..], b"one");

    let mut guard = ht.lock_key(b"alpha");
    let released = guard.release(b"alpha").unwrap();
    assert_eq!(released.key, b"alpha");
    drop(guard);

    assert_eq!(ht.num_items(), 1);
    assert!(ht.find(b"alpha", false, false).is_none());
}

#[test]
fn test_find_skips_tombstones_unless_asked() {
    let ht = table(EvictionPolicy::ValueOnly);
    let mut item = Item::new(b"dead".to_vec(), Vec::new());
    item.deleted = true;
    {
        let mut guard = ht.lock_key(b"dead");
        guard.insert(StoredValue::from_item(&item));
    }

    assert!(ht.find(b"dead", false, false).is_none());
    assert!(ht.find(b"dead", false, true).is_some());
    assert_eq!(ht.counters.num_deleted.load(Ordering::Acquire), 1);
    assert_eq!(ht.num_items(), 0);
}

#[test]
fn test_mem_accounting_tracks_inserts_and_removals() {
    let stats = Arc::new(Statistics::new());
    let ht = HashTable::new(23, 4, EvictionPolicy::ValueOnly, stats.clone());

    insert_kv(&ht, b"k1", b"some value");
    let after_insert = stats.mem_used();
    assert!(after_insert > 0);
    assert_eq!(after_insert, ht.mem_size());

    let mut guard = ht.lock_key(b"k1");
    guard.release(b"k1");
    drop(guard);
    assert_eq!(stats.mem_used(), 0);
    assert_eq!(ht.mem_size(), 0);
}

#[test]
fn test_eject_value_keeps_metadata() {
    let ht = table(EvictionPolicy::ValueOnly);
    insert_kv(&ht, b"key", b"a value worth caching");

    let mut guard = ht.lock_key(b"key");
    assert!(guard.eject(b"key"));
    let sv = guard.find(b"key", false, false).unwrap();
    assert!(!sv.is_resident());
    assert!(sv.value.is_none());
    drop(guard);

    assert_eq!(ht.num_items(), 1);
    assert_eq!(ht.counters.num_non_resident.load(Ordering::Acquire), 1);
}

#[test]
fn test_eject_full_unlinks_record() {
    let ht = table(EvictionPolicy::FullEviction);
    insert_kv(&ht, b"key", b"value");
    ht.counters.num_total_items.store(1, Ordering::Release);

    let mut guard = ht.lock_key(b"key");
    assert!(guard.eject(b"key"));
    assert!(guard.find(b"key", true, false).is_none());
    drop(guard);

    assert_eq!(ht.num_items(), 0);
    // still counted as a live document on disk
    assert_eq!(ht.counters.num_total_items.load(Ordering::Acquire), 1);
}

#[test]
fn test_dirty_items_refuse_ejection() {
    let ht = table(EvictionPolicy::ValueOnly);
    let item = Item::new(b"dirty".to_vec(), b"v".to_vec());
    {
        let mut guard = ht.lock_key(b"dirty");
        let sv = guard.insert(StoredValue::from_item(&item));
        sv.dirty = true;
    }

    let mut guard = ht.lock_key(b"dirty");
    assert!(!guard.eject(b"dirty"));
    assert!(guard.find(b"dirty", false, false).unwrap().is_resident());
}

#[test]
fn test_resize_preserves_items() {
    let ht = table(EvictionPolicy::ValueOnly);
    for i in 0..100u32 {
        let key = format!("key-{i}");
        insert_kv(&ht, key.as_bytes(), b"v");
    }
    assert_eq!(ht.num_items(), 100);

    ht.resize(Some(769));
    assert_eq!(ht.size(), 769);
    assert_eq!(ht.num_items(), 100);
    for i in 0..100u32 {
        let key = format!("key-{i}");
        assert!(ht.find(key.as_bytes(), false, false).is_some(), "{key}");
    }

    ht.resize(Some(47));
    assert_eq!(ht.size(), 47);
    assert_eq!(ht.num_items(), 100);
}

#[test]
fn test_resize_with_concurrent_inserts() {
    let ht = Arc::new(table(EvictionPolicy::ValueOnly));
    let writers: Vec<_> = (0..4)
        .map(|t| {
            let ht = ht.clone();
            std::thread::spawn(move || {
                for i in 0..250u32 {
                    let key = format!("t{t}-key-{i}");
                    let item = Item::new(key.into_bytes(), b"v".to_vec());
                    let mut guard = ht.lock_key(&item.key);
                    guard.insert(StoredValue::from_item(&item));
                }
            })
        })
        .collect();

    let resizer = {
        let ht = ht.clone();
        std::thread::spawn(move || {
            for size in [97, 383, 769, 3079] {
                ht.resize(Some(size));
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    resizer.join().unwrap();

    // final item count equals inserts minus deletes (no deletes here)
    assert_eq!(ht.num_items(), 1000);
    for t in 0..4 {
        for i in 0..250u32 {
            let key = format!("t{t}-key-{i}");
            assert!(ht.find(key.as_bytes(), false, false).is_some(), "{key}");
        }
    }
}

struct CountingVisitor {
    seen: usize,
    pause_every: usize,
    since_pause: usize,
}

impl HashTableVisitor for CountingVisitor {
    fn visit(&mut self, _sv: &mut StoredValue) -> VisitAction {
        self.seen += 1;
        self.since_pause += 1;
        VisitAction::Keep
    }

    fn should_continue(&mut self) -> bool {
        if self.since_pause >= self.pause_every {
            self.since_pause = 0;
            return false;
        }
        true
    }
}

#[test]
fn test_pause_resume_visit_sees_every_item() {
    let ht = table(EvictionPolicy::ValueOnly);
    for i in 0..50u32 {
        insert_kv(&ht, format!("key-{i}").as_bytes(), b"v");
    }

    let mut visitor = CountingVisitor {
        seen: 0,
        pause_every: 7,
        since_pause: 0,
    };
    let mut pos = Position::begin();
    let mut rounds = 0;
    loop {
        pos = ht.pause_resume_visit(&mut visitor, pos);
        rounds += 1;
        if pos.is_end(ht.num_locks()) {
            break;
        }
        assert!(rounds < 10_000, "visit failed to make progress");
    }
    assert_eq!(visitor.seen, 50);
    assert!(rounds > 1, "expected the visitor to pause at least once");
}

#[test]
fn test_visit_restarts_after_resize() {
    let ht = table(EvictionPolicy::ValueOnly);
    for i in 0..20u32 {
        insert_kv(&ht, format!("key-{i}").as_bytes(), b"v");
    }

    let mut visitor = CountingVisitor {
        seen: 0,
        pause_every: 5,
        since_pause: 0,
    };
    let pos = ht.pause_resume_visit(&mut visitor, Position::begin());
    assert!(!pos.is_end(ht.num_locks()));

    ht.resize(Some(97));

    // the stale position is detected and the walk starts over
    let mut visitor2 = CountingVisitor {
        seen: 0,
        pause_every: usize::MAX,
        since_pause: 0,
    };
    let end = ht.pause_resume_visit(&mut visitor2, pos);
    assert!(end.is_end(ht.num_locks()));
    assert_eq!(visitor2.seen, 20);
}

#[test]
fn test_random_key_finds_live_items_only() {
    let ht = table(EvictionPolicy::ValueOnly);
    assert!(ht.random_key(7).is_none());

    let mut item = Item::new(b"gone".to_vec(), Vec::new());
    item.deleted = true;
    {
        let mut guard = ht.lock_key(b"gone");
        guard.insert(StoredValue::from_item(&item));
    }
    assert!(ht.random_key(7).is_none());

    insert_kv(&ht, b"alive", b"v");
    assert_eq!(ht.random_key(7).unwrap(), b"alive");
}
