use crate::core::bloom::BloomFilter;

#[test]
fn test_inserted_keys_always_match() {
    let mut filter = BloomFilter::new(1000, 0.01);
    for i in 0..1000u32 {
        filter.insert(format!("key-{i}").as_bytes());
    }
    for i in 0..1000u32 {
        assert!(filter.maybe_contains(format!("key-{i}").as_bytes()));
    }
    assert_eq!(filter.key_count(), 1000);
}

#[test]
fn test_false_positive_rate_is_bounded() {
    let mut filter = BloomFilter::new(10_000, 0.01);
    for i in 0..10_000u32 {
        filter.insert(format!("present-{i}").as_bytes());
    }

    let mut false_positives = 0;
    let probes = 10_000;
    for i in 0..probes {
        if filter.maybe_contains(format!("absent-{i}").as_bytes()) {
            false_positives += 1;
        }
    }
    // 1% target; allow generous slack to keep the test stable
    assert!(
        false_positives < probes / 20,
        "fp rate too high: {false_positives}/{probes}"
    );
}

#[test]
fn test_empty_filter_matches_nothing() {
    let filter = BloomFilter::new(100, 0.01);
    assert!(!filter.maybe_contains(b"anything"));
    assert_eq!(filter.key_count(), 0);
}

#[test]
fn test_reported_parameters() {
    let filter = BloomFilter::new(5000, 0.05);
    assert!(filter.num_bits() > 0);
    assert!((filter.fp_probability() - 0.05).abs() < f64::EPSILON);
}
