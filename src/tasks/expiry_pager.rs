use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use crate::core::hash_table::{HashTableVisitor, VisitAction};
use crate::core::store::EmberStore;
use crate::core::stored_value::StoredValue;
use crate::core::vbucket::{ExpirySource, VBucketState};
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};
use crate::utils::time::unix_now;

/// Collects the keys of expired documents; the deletes are issued after
/// the walk so the tombstone path can retake the bucket locks.
struct ExpiryVisitor {
    now: u32,
    expired: Vec<Vec<u8>>,
}

impl HashTableVisitor for ExpiryVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction {
        if !sv.deleted && !sv.temp && sv.is_expired(self.now) {
            self.expired.push(sv.key.clone());
        }
        VisitAction::Keep
    }
}

/// AuxIO task that sweeps active vbuckets every `exp_pager_stime`,
/// tombstoning documents whose expiration has passed.
pub struct ExpiryPagerTask {
    store: Weak<EmberStore>,
    stime: Duration,
}

impl ExpiryPagerTask {
    pub fn new(store: Weak<EmberStore>, stime: Duration) -> Self {
        Self { store, stime }
    }
}

impl GlobalTask for ExpiryPagerTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        store
            .stats()
            .expiry_pager_runs
            .fetch_add(1, Ordering::Relaxed);

        let now = unix_now();
        let mut swept = 0usize;
        for vb in store.all_vbuckets() {
            if vb.state() != VBucketState::Active {
                continue;
            }
            let mut visitor = ExpiryVisitor {
                now,
                expired: Vec::new(),
            };
            vb.ht.visit(&mut visitor);
            swept += visitor.expired.len();
            for key in visitor.expired {
                vb.process_expiry(&key, ExpirySource::Pager);
            }
        }
        if swept > 0 {
            tracing::debug!(swept, "expiry pager pass");
            store.notify_flushers();
        }

        handle.snooze(self.stime);
        true
    }

    fn description(&self) -> String {
        "Paging expired items".to_string()
    }

    fn task_type(&self) -> TaskType {
        TaskType::AuxIO
    }

    fn kind(&self) -> TaskKind {
        TaskKind::ExpiryPager
    }
}
