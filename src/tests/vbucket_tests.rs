use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::core::item::{Item, ItemMeta};
use crate::core::notifier::{ChannelNotifier, NotifyStatus, NullNotifier};
use crate::core::vbucket::{
    ExpirySource, VBucket, VBucketOptions, VBucketSeeds, VBucketState, WithMetaOutcome,
};
use crate::error::EmberError;
use crate::stats::Statistics;
use crate::utils::time::unix_now;

fn active_vb() -> VBucket {
    VBucket::new(
        0,
        VBucketState::Active,
        VBucketOptions::default(),
        VBucketSeeds::default(),
        Arc::new(NullNotifier),
        Arc::new(Statistics::new()),
    )
}

#[test]
fn test_set_then_get_returns_value_and_cas() {
    let vb = active_vb();
    let cas = vb.set(Item::new(b"k1".to_vec(), b"v1".to_vec()), 0, None).unwrap();

    let item = vb.get(b"k1", None).unwrap();
    assert_eq!(&item.value[..], b"v1");
    assert_eq!(item.meta.cas, cas);
    assert_eq!(item.meta.rev_seqno, 1);
    assert_eq!(item.by_seqno, 1);
}

#[test]
fn test_mutations_increase_seqno_cas_and_rev() {
    let vb = active_vb();
    let mut last_cas = 0;
    for i in 1..=5u64 {
        let cas = vb
            .set(Item::new(b"key".to_vec(), format!("v{i}").into_bytes()), 0, None)
            .unwrap();
        assert!(cas > last_cas, "cas must increase per mutation");
        last_cas = cas;

        let item = vb.get(b"key", None).unwrap();
        assert_eq!(item.meta.rev_seqno, i);
        assert_eq!(item.by_seqno, i);
    }
    assert_eq!(vb.high_seqno(), 5);
}

#[test]
fn test_cas_mismatch_and_missing_key() {
    let vb = active_vb();
    let cas = vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    let err = vb
        .set(Item::new(b"k".to_vec(), b"x".to_vec()), cas + 1, None)
        .unwrap_err();
    assert!(matches!(err, EmberError::KeyExists));

    let err = vb
        .set(Item::new(b"absent".to_vec(), b"x".to_vec()), 42, None)
        .unwrap_err();
    assert!(matches!(err, EmberError::KeyNotFound));

    // matching cas succeeds
    vb.set(Item::new(b"k".to_vec(), b"y".to_vec()), cas, None).unwrap();
    assert_eq!(&vb.get(b"k", None).unwrap().value[..], b"y");
}

#[test]
fn test_add_semantics() {
    let vb = active_vb();
    vb.add(Item::new(b"k".to_vec(), b"v".to_vec()), None).unwrap();

    let err = vb.add(Item::new(b"k".to_vec(), b"w".to_vec()), None).unwrap_err();
    assert!(matches!(err, EmberError::KeyExists));
}

#[test]
fn test_add_on_tombstone_revives_with_bumped_rev() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();
    vb.delete(b"k", 0, None).unwrap();
    assert!(matches!(vb.get(b"k", None).unwrap_err(), EmberError::KeyNotFound));

    vb.add(Item::new(b"k".to_vec(), b"w".to_vec()), None).unwrap();
    let item = vb.get(b"k", None).unwrap();
    assert_eq!(&item.value[..], b"w");
    // set=1, delete=2, undelete=3
    assert_eq!(item.meta.rev_seqno, 3);
}

#[test]
fn test_replace_requires_existing() {
    let vb = active_vb();
    let err = vb
        .replace(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None)
        .unwrap_err();
    assert!(matches!(err, EmberError::KeyNotFound));

    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();
    vb.replace(Item::new(b"k".to_vec(), b"w".to_vec()), 0, None).unwrap();
    assert_eq!(&vb.get(b"k", None).unwrap().value[..], b"w");
}

#[test]
fn test_delete_with_cas() {
    let vb = active_vb();
    let cas = vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    let err = vb.delete(b"k", cas + 5, None).unwrap_err();
    assert!(matches!(err, EmberError::KeyExists));

    vb.delete(b"k", cas, None).unwrap();
    assert!(matches!(vb.get(b"k", None).unwrap_err(), EmberError::KeyNotFound));
}

#[test]
fn test_datatype_round_trips_through_the_table() {
    let vb = active_vb();
    let item = Item::new(b"doc".to_vec(), b"{}".to_vec())
        .with_datatype(crate::constants::DATATYPE_JSON)
        .with_flags(0xdeadbeef);
    vb.set(item, 0, None).unwrap();

    let got = vb.get(b"doc", None).unwrap();
    assert_eq!(got.datatype, crate::constants::DATATYPE_JSON);
    assert_eq!(got.meta.flags, 0xdeadbeef);
}

#[test]
fn test_getl_blocks_mutations_until_unlock() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    let locked = vb.get_locked(b"k", Some(Duration::from_secs(10)), None).unwrap();

    // plain set fails while locked
    let err = vb.set(Item::new(b"k".to_vec(), b"x".to_vec()), 0, None).unwrap_err();
    assert!(matches!(err, EmberError::Locked));

    // a second GETL also fails
    let err = vb.get_locked(b"k", None, None).unwrap_err();
    assert!(matches!(err, EmberError::Locked));

    // get sees the locked CAS sentinel
    let item = vb.get(b"k", None).unwrap();
    assert_eq!(item.meta.cas, crate::constants::LOCKED_CAS);

    // unlock with the wrong token fails, with the right one succeeds
    let err = vb.unlock(b"k", locked.meta.cas + 1, None).unwrap_err();
    assert!(matches!(err, EmberError::Locked));
    vb.unlock(b"k", locked.meta.cas, None).unwrap();

    vb.set(Item::new(b"k".to_vec(), b"x".to_vec()), 0, None).unwrap();
}

#[test]
fn test_getl_lock_expires() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    vb.get_locked(b"k", Some(Duration::from_millis(300)), None).unwrap();
    assert!(matches!(
        vb.get_locked(b"k", None, None).unwrap_err(),
        EmberError::Locked
    ));

    std::thread::sleep(Duration::from_millis(400));
    vb.get_locked(b"k", None, None).unwrap();
}

#[test]
fn test_set_with_matching_cas_releases_lock() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();
    let locked = vb.get_locked(b"k", Some(Duration::from_secs(10)), None).unwrap();

    vb.set(Item::new(b"k".to_vec(), b"new".to_vec()), locked.meta.cas, None)
        .unwrap();
    // lock is gone; an unlocked set now works
    vb.set(Item::new(b"k".to_vec(), b"newer".to_vec()), 0, None).unwrap();
}

#[test]
fn test_set_with_meta_conflict_resolution() {
    let vb = active_vb();
    let stored_cas = vb.set(Item::new(b"k".to_vec(), b"local".to_vec()), 0, None).unwrap();
    let high_before = vb.high_seqno();

    // incoming with a smaller revSeqno loses
    let losing = Item::new(b"k".to_vec(), b"remote".to_vec()).with_meta(ItemMeta {
        cas: 1,
        rev_seqno: 0,
        flags: 0,
        exptime: 0,
    });
    let outcome = vb.set_with_meta(losing, false, None).unwrap();
    assert!(matches!(outcome, WithMetaOutcome::Skipped));
    assert_eq!(&vb.get(b"k", None).unwrap().value[..], b"local");
    assert_eq!(vb.high_seqno(), high_before, "a skipped op advances nothing");

    // incoming with a larger revSeqno wins and keeps its own meta
    let winning = Item::new(b"k".to_vec(), b"remote".to_vec()).with_meta(ItemMeta {
        cas: stored_cas + 1000,
        rev_seqno: 99,
        flags: 7,
        exptime: 0,
    });
    let outcome = vb.set_with_meta(winning, false, None).unwrap();
    assert!(matches!(outcome, WithMetaOutcome::Stored { .. }));
    let item = vb.get(b"k", None).unwrap();
    assert_eq!(&item.value[..], b"remote");
    assert_eq!(item.meta.rev_seqno, 99);
    assert_eq!(item.meta.flags, 7);
}

#[test]
fn test_set_with_meta_force_overrides() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"local".to_vec()), 0, None).unwrap();

    let losing = Item::new(b"k".to_vec(), b"forced".to_vec()).with_meta(ItemMeta {
        cas: 1,
        rev_seqno: 0,
        flags: 0,
        exptime: 0,
    });
    let outcome = vb.set_with_meta(losing, true, None).unwrap();
    assert!(matches!(outcome, WithMetaOutcome::Stored { .. }));
    assert_eq!(&vb.get(b"k", None).unwrap().value[..], b"forced");
}

#[test]
fn test_del_with_meta_creates_tombstone_with_meta() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    let meta = ItemMeta {
        cas: u64::MAX - 10,
        rev_seqno: 50,
        flags: 0,
        exptime: 0,
    };
    let outcome = vb.del_with_meta(b"k", meta, false, None).unwrap();
    assert!(matches!(outcome, WithMetaOutcome::Stored { .. }));

    let (got_meta, deleted, _) = vb.get_meta(b"k", None).unwrap();
    assert!(deleted);
    assert_eq!(got_meta.rev_seqno, 50);
}

#[test]
fn test_expiry_on_access() {
    let vb = active_vb();
    let item = Item::new(b"e".to_vec(), b"x".to_vec()).with_exptime(unix_now().saturating_sub(1));
    vb.set(item, 0, None).unwrap();

    let err = vb.get(b"e", None).unwrap_err();
    assert!(matches!(err, EmberError::KeyNotFound));
    assert_eq!(vb.num_expired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_process_expiry_sources_count_separately() {
    let vb = active_vb();
    for (i, source) in [ExpirySource::Pager, ExpirySource::Compactor]
        .into_iter()
        .enumerate()
    {
        let key = format!("e{i}").into_bytes();
        let item = Item::new(key.clone(), b"x".to_vec()).with_exptime(unix_now().saturating_sub(1));
        vb.set(item, 0, None).unwrap();
        vb.process_expiry(&key, source);
    }
    assert_eq!(vb.num_expired.load(Ordering::Relaxed), 2);
}

#[test]
fn test_state_machine_rejections() {
    let vb = active_vb();
    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();

    vb.set_state(VBucketState::Replica, false);
    assert!(matches!(
        vb.set(Item::new(b"k".to_vec(), b"x".to_vec()), 0, None).unwrap_err(),
        EmberError::NotMyVbucket
    ));
    assert!(matches!(vb.get(b"k", None).unwrap_err(), EmberError::NotMyVbucket));

    vb.set_state(VBucketState::Dead, false);
    assert!(matches!(
        vb.get(b"k", None).unwrap_err(),
        EmberError::NotMyVbucket
    ));
}

#[test]
fn test_pending_parks_cookie_and_resumes_on_activate() {
    let (notifier, rx) = ChannelNotifier::new();
    let vb = VBucket::new(
        1,
        VBucketState::Pending,
        VBucketOptions::default(),
        VBucketSeeds::default(),
        Arc::new(notifier),
        Arc::new(Statistics::new()),
    );

    let err = vb
        .set(Item::new(b"p".to_vec(), b"q".to_vec()), 0, Some(77))
        .unwrap_err();
    assert!(matches!(err, EmberError::WouldBlock));
    assert!(rx.try_recv().is_err(), "cookie must not fire while pending");

    vb.set_state(VBucketState::Active, false);
    let (cookie, status) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(cookie, 77);
    assert_eq!(status, NotifyStatus::Success);

    // the resumed operation now succeeds
    vb.set(Item::new(b"p".to_vec(), b"q".to_vec()), 0, Some(77)).unwrap();
    assert!(rx.try_recv().is_err(), "exactly one notification per parking");
}

#[test]
fn test_dead_transition_notifies_pending_cookies_once() {
    let (notifier, rx) = ChannelNotifier::new();
    let vb = VBucket::new(
        1,
        VBucketState::Pending,
        VBucketOptions::default(),
        VBucketSeeds::default(),
        Arc::new(notifier),
        Arc::new(Statistics::new()),
    );

    let _ = vb.set(Item::new(b"p".to_vec(), b"q".to_vec()), 0, Some(5));
    vb.set_state(VBucketState::Dead, false);

    let (cookie, status) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(cookie, 5);
    assert_eq!(status, NotifyStatus::NotMyVbucket);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_transition_to_active_starts_new_lineage() {
    let vb = active_vb();
    let first = vb.current_uuid();

    vb.set_state(VBucketState::Replica, false);
    vb.set_state(VBucketState::Active, false);
    assert_ne!(vb.current_uuid(), first);

    // a transfer keeps the lineage
    let current = vb.current_uuid();
    vb.set_state(VBucketState::Replica, false);
    vb.set_state(VBucketState::Active, true);
    assert_eq!(vb.current_uuid(), current);
}

#[test]
fn test_seqno_invariants_hold_after_persistence_callback() {
    let vb = active_vb();
    for i in 0..5 {
        vb.set(Item::new(format!("k{i}").into_bytes(), b"v".to_vec()), 0, None)
            .unwrap();
    }

    let drain = vb
        .checkpoints
        .drain_cursor(crate::core::checkpoint::PERSISTENCE_CURSOR, 100)
        .unwrap();
    let items: Vec<_> = drain.items.into_iter().filter_map(|e| e.item).collect();
    vb.on_persisted(&items, drain.snap_start, drain.snap_end);

    assert_eq!(vb.last_persisted_seqno(), 5);
    assert!(vb.high_seqno() >= vb.last_persisted_seqno());
    assert!(vb.last_persisted_seqno() >= vb.purge_seqno());

    // dirty flags cleared
    let (state, _) = vb.observe_key(b"k0");
    assert_eq!(state, 0x01, "persisted");
}

#[test]
fn test_observe_key_states() {
    let vb = active_vb();
    let (state, cas) = vb.observe_key(b"missing");
    assert_eq!((state, cas), (0x80, 0));

    vb.set(Item::new(b"k".to_vec(), b"v".to_vec()), 0, None).unwrap();
    let (state, _) = vb.observe_key(b"k");
    assert_eq!(state, 0x00, "dirty until flushed");

    vb.delete(b"k", 0, None).unwrap();
    let (state, _) = vb.observe_key(b"k");
    assert_eq!(state, 0x81, "logically deleted");
}
