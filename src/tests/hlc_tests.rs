use crate::core::hlc::HybridClock;

#[test]
fn test_cas_strictly_monotonic() {
    let hlc = HybridClock::new(0, 5_000_000, 5_000_000);
    let mut last = 0;
    for _ in 0..10_000 {
        let cas = hlc.next_cas();
        assert!(cas > last);
        last = cas;
    }
}

#[test]
fn test_seeded_from_persisted_max_cas() {
    let future = u64::MAX / 2;
    let hlc = HybridClock::new(future, 5_000_000, 5_000_000);
    assert!(hlc.next_cas() > future, "monotonic across restarts");
}

#[test]
fn test_observe_cas_folds_larger_values() {
    let hlc = HybridClock::new(0, 5_000_000, 5_000_000);
    let local = hlc.next_cas();
    let incoming = local + 1_000_000;
    hlc.observe_cas(incoming);
    assert!(hlc.max_cas() >= incoming);
    assert!(hlc.next_cas() > incoming);
}

#[test]
fn test_drift_ahead_counter() {
    // ahead threshold 1ms; an incoming CAS one hour ahead trips it
    let hlc = HybridClock::new(0, 1_000, 1_000_000_000);
    let hour_ns = 3600u64 * 1_000_000_000;
    let incoming = crate::utils::time::unix_now_ns() + hour_ns;
    hlc.observe_cas(incoming);
    assert_eq!(hlc.drift_ahead_count(), 1);
    assert_eq!(hlc.drift_behind_count(), 0);
}

#[test]
fn test_drift_behind_counter() {
    // behind threshold 1ms; an incoming CAS one hour behind trips it
    let hlc = HybridClock::new(0, 1_000_000_000, 1_000);
    let hour_ns = 3600u64 * 1_000_000_000;
    let incoming = crate::utils::time::unix_now_ns() - hour_ns;
    hlc.observe_cas(incoming);
    assert_eq!(hlc.drift_behind_count(), 1);
    assert_eq!(hlc.drift_ahead_count(), 0);
}

#[test]
fn test_small_drift_not_counted() {
    let hlc = HybridClock::new(0, 5_000_000, 5_000_000);
    hlc.observe_cas(crate::utils::time::unix_now_ns());
    assert_eq!(hlc.drift_ahead_count(), 0);
    assert_eq!(hlc.drift_behind_count(), 0);
}
