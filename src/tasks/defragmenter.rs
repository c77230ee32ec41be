use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;

use crate::core::hash_table::{HashTableVisitor, VisitAction};
use crate::core::store::EmberStore;
use crate::core::stored_value::StoredValue;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};
use crate::stats::Statistics;

/// Re-materializes blobs that have sat untouched for `age_threshold`
/// sweeps, compacting allocator fragmentation around long-lived values.
struct DefragVisitor<'a> {
    age_threshold: u8,
    stats: &'a Statistics,
}

impl<'a> HashTableVisitor for DefragVisitor<'a> {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction {
        if sv.deleted || sv.temp || !sv.is_resident() {
            return VisitAction::Keep;
        }
        self.stats.defrag_visited.fetch_add(1, Ordering::Relaxed);
        if sv.value_age >= self.age_threshold {
            if let Some(value) = sv.value.as_ref() {
                sv.value = Some(Bytes::copy_from_slice(value));
                sv.value_age = 0;
                self.stats.defrag_moved.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            sv.value_age = sv.value_age.saturating_add(1);
        }
        VisitAction::Keep
    }
}

/// NonIO task running the defragmentation sweep on an interval.
pub struct DefragmenterTask {
    store: Weak<EmberStore>,
    interval: Duration,
    age_threshold: u8,
}

impl DefragmenterTask {
    pub fn new(store: Weak<EmberStore>, interval: Duration, age_threshold: u8) -> Self {
        Self {
            store,
            interval,
            age_threshold,
        }
    }
}

impl GlobalTask for DefragmenterTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        for vb in store.all_vbuckets() {
            let mut visitor = DefragVisitor {
                age_threshold: self.age_threshold,
                stats: store.stats().as_ref(),
            };
            vb.ht.visit(&mut visitor);
        }

        handle.snooze(self.interval);
        true
    }

    fn description(&self) -> String {
        "Memory defragmenter".to_string()
    }

    fn task_type(&self) -> TaskType {
        TaskType::NonIO
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Defragmenter
    }
}
