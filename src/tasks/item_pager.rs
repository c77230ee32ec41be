use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use crate::constants::{MAX_NRU, PAGER_VISIT_CHUNK};
use crate::core::hash_table::{HashTableVisitor, Position, VisitAction};
use crate::core::store::EmberStore;
use crate::core::stored_value::StoredValue;
use crate::core::vbucket::VBucketState;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};

const IDLE_SLEEP: Duration = Duration::from_secs(10);
const BUSY_SLEEP: Duration = Duration::from_secs(1);

/// Time-sliced visitor that ejects not-recently-used items and ages the
/// survivors so they become eligible on the next round.
struct PagingVisitor<'a> {
    store: &'a EmberStore,
    low_wat: usize,
    budget: usize,
}

impl<'a> PagingVisitor<'a> {
    fn below_low_wat(&self) -> bool {
        self.store.stats().mem_used() <= self.low_wat
    }
}

impl<'a> HashTableVisitor for PagingVisitor<'a> {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction {
        self.budget = self.budget.saturating_sub(1);
        if self.below_low_wat() {
            return VisitAction::Keep;
        }
        if sv.dirty || sv.deleted || sv.temp {
            return VisitAction::Keep;
        }
        if sv.nru >= MAX_NRU {
            // the table downgrades this to a value ejection when the
            // policy keeps metadata resident
            VisitAction::EjectItem
        } else {
            sv.nru += 1;
            VisitAction::Keep
        }
    }

    fn should_continue(&mut self) -> bool {
        self.budget > 0 && !self.below_low_wat()
    }
}

/// NonIO task that reclaims memory once `mem_used` crosses the high
/// watermark, stopping at the low watermark. Active vbuckets are visited
/// first for the configured share of the pass.
pub struct ItemPagerTask {
    store: Weak<EmberStore>,
}

impl ItemPagerTask {
    pub fn new(store: Weak<EmberStore>) -> Self {
        Self { store }
    }
}

impl GlobalTask for ItemPagerTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        let high_wat = store.mem_high_wat();
        let low_wat = store.mem_low_wat();
        if store.stats().mem_used() <= high_wat {
            handle.snooze(IDLE_SLEEP);
            return true;
        }

        store.stats().pager_runs.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            mem_used = store.stats().mem_used(),
            high_wat,
            low_wat,
            "item pager pass"
        );

        // active vbuckets take the first share of the pass
        let mut vbuckets = store.all_vbuckets();
        vbuckets.sort_by_key(|vb| match vb.state() {
            VBucketState::Active => 0u8,
            VBucketState::Replica => 1,
            VBucketState::Pending => 2,
            VBucketState::Dead => 3,
        });
        let active_share = store.pager_active_share();
        let (first, rest) = vbuckets.split_at(active_share.min(vbuckets.len()));

        'pass: for vb in first.iter().chain(rest.iter()) {
            if vb.state() == VBucketState::Dead {
                continue;
            }
            let mut pos = Position::begin();
            loop {
                if store.stats().mem_used() <= low_wat {
                    break 'pass;
                }
                let mut visitor = PagingVisitor {
                    store: store.as_ref(),
                    low_wat,
                    budget: PAGER_VISIT_CHUNK,
                };
                pos = vb.ht.pause_resume_visit(&mut visitor, pos);
                if pos.is_end(vb.ht.num_locks()) {
                    break;
                }
            }
        }

        if store.stats().mem_used() > high_wat {
            handle.snooze(BUSY_SLEEP);
        } else {
            handle.snooze(IDLE_SLEEP);
        }
        true
    }

    fn description(&self) -> String {
        "Paging out items".to_string()
    }

    fn task_type(&self) -> TaskType {
        TaskType::NonIO
    }

    fn kind(&self) -> TaskKind {
        TaskKind::ItemPager
    }

    fn priority(&self) -> u8 {
        1
    }
}
