use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::hlc::HybridClock;
use crate::core::item::Item;
use crate::stats::{sub_guarded, Statistics};

/// Name under which the flusher's cursor is registered at creation.
pub const PERSISTENCE_CURSOR: &str = "persistence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Mutation,
    Deletion,
    CheckpointStart,
    CheckpointEnd,
}

/// One entry in a vbucket's ordered mutation log.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub op: QueueOp,
    pub by_seqno: u64,
    /// Absent for checkpoint markers.
    pub item: Option<Item>,
}

impl QueuedItem {
    fn marker(op: QueueOp, by_seqno: u64) -> Self {
        Self {
            op,
            by_seqno,
            item: None,
        }
    }

    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.item.as_ref().map_or(0, Item::size)
    }
}

#[derive(Debug)]
struct Checkpoint {
    id: u64,
    snap_start: u64,
    snap_end: u64,
    open: bool,
    items: Vec<QueuedItem>,
}

impl Checkpoint {
    fn new(id: u64, snap_start: u64) -> Self {
        Self {
            id,
            snap_start,
            snap_end: snap_start,
            open: true,
            items: vec![QueuedItem::marker(QueueOp::CheckpointStart, snap_start)],
        }
    }

    fn num_mutations(&self) -> usize {
        self.items
            .iter()
            .filter(|e| matches!(e.op, QueueOp::Mutation | QueueOp::Deletion))
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
struct CursorPos {
    ckpt_id: u64,
    idx: usize,
}

struct CmInner {
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, CursorPos>,
    queued_mem: usize,
}

/// Result of draining a cursor: the mutations in bySeqno order plus the
/// disk-snapshot range they belong to.
#[derive(Debug)]
pub struct CursorDrain {
    pub items: Vec<QueuedItem>,
    pub snap_start: u64,
    pub snap_end: u64,
    pub checkpoint_id: u64,
}

/// Per-vbucket ordered log of mutations, consumed by the persistence
/// cursor and any registered replication cursors. Entries are totally
/// ordered by bySeqno; closed checkpoints behind every cursor are freed.
pub struct CheckpointManager {
    inner: Mutex<CmInner>,
    max_items: usize,
    stats: Arc<Statistics>,
}

impl CheckpointManager {
    pub fn new(start_seqno: u64, max_items: usize, stats: Arc<Statistics>) -> Self {
        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            CursorPos { ckpt_id: 1, idx: 1 },
        );
        Self {
            inner: Mutex::new(CmInner {
                checkpoints: VecDeque::from([Checkpoint::new(1, start_seqno)]),
                cursors,
                queued_mem: 0,
            }),
            max_items,
            stats,
        }
    }

    /// Stamp the item with the next bySeqno (and a fresh CAS when asked)
    /// and append it to the open checkpoint. Seqno assignment and append
    /// happen under one lock so cursors observe assignment order.
    pub fn queue_dirty(
        &self,
        item: &mut Item,
        high_seqno: &AtomicU64,
        cas_source: Option<&HybridClock>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let seqno = high_seqno.fetch_add(1, Ordering::AcqRel) + 1;
        item.by_seqno = seqno;
        if let Some(hlc) = cas_source {
            item.meta.cas = hlc.next_cas();
        }

        let op = if item.deleted {
            QueueOp::Deletion
        } else {
            QueueOp::Mutation
        };
        let entry = QueuedItem {
            op,
            by_seqno: seqno,
            item: Some(item.clone()),
        };
        inner.queued_mem += entry.mem_size();
        self.stats.diskqueue_items.fetch_add(1, Ordering::AcqRel);
        self.stats
            .diskqueue_mem
            .fetch_add(entry.mem_size(), Ordering::AcqRel);

        let roll = {
            let open = inner
                .checkpoints
                .back_mut()
                .expect("checkpoint list is never empty");
            open.snap_end = seqno;
            open.items.push(entry);
            open.num_mutations() >= self.max_items
        };
        if roll {
            Self::roll_open_checkpoint(&mut inner, seqno);
        }
        seqno
    }

    fn roll_open_checkpoint(inner: &mut CmInner, high_seqno: u64) {
        let next_id = {
            let open = inner
                .checkpoints
                .back_mut()
                .expect("checkpoint list is never empty");
            if !open.open {
                return;
            }
            open.open = false;
            open.snap_end = high_seqno;
            open.items
                .push(QueuedItem::marker(QueueOp::CheckpointEnd, high_seqno));
            open.id + 1
        };
        inner
            .checkpoints
            .push_back(Checkpoint::new(next_id, high_seqno));
    }

    /// Close the open checkpoint and start a new one.
    pub fn create_new_checkpoint(&self, high_seqno: u64) {
        let mut inner = self.inner.lock();
        Self::roll_open_checkpoint(&mut inner, high_seqno);
    }

    /// Register a cursor at the current head of the log.
    pub fn register_cursor(&self, name: &str) {
        let mut inner = self.inner.lock();
        let front = inner
            .checkpoints
            .front()
            .expect("checkpoint list is never empty");
        let pos = CursorPos {
            ckpt_id: front.id,
            idx: 1,
        };
        inner.cursors.insert(name.to_string(), pos);
    }

    pub fn remove_cursor(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.cursors.remove(name);
        Self::collect_closed(&mut inner);
    }

    /// Advance `cursor` by up to `limit` mutations, returning them in
    /// bySeqno order together with the snapshot range reached.
    pub fn drain_cursor(&self, cursor: &str, limit: usize) -> Option<CursorDrain> {
        let mut inner = self.inner.lock();
        let mut pos = *inner.cursors.get(cursor)?;

        let mut items = Vec::new();
        let mut snap_start = 0;
        let mut snap_end = 0;
        let mut checkpoint_id = pos.ckpt_id;

        'outer: loop {
            let Some(ckpt_off) = inner.checkpoints.iter().position(|c| c.id == pos.ckpt_id) else {
                break;
            };
            let ckpt = &inner.checkpoints[ckpt_off];
            snap_start = ckpt.snap_start;
            snap_end = ckpt.snap_end;
            checkpoint_id = ckpt.id;

            while pos.idx < ckpt.items.len() {
                if items.len() >= limit {
                    break 'outer;
                }
                let entry = &ckpt.items[pos.idx];
                pos.idx += 1;
                if matches!(entry.op, QueueOp::Mutation | QueueOp::Deletion) {
                    items.push(entry.clone());
                }
            }

            if ckpt.open {
                // reached the open checkpoint's tail
                break;
            }
            pos = CursorPos {
                ckpt_id: ckpt.id + 1,
                idx: 0,
            };
        }

        inner.cursors.insert(cursor.to_string(), pos);
        if !items.is_empty() {
            let released: usize = items.iter().map(QueuedItem::mem_size).sum();
            sub_guarded_mem(&mut inner, released);
            sub_guarded(&self.stats.diskqueue_items, items.len(), "diskqueue_items");
            sub_guarded(&self.stats.diskqueue_mem, released, "diskqueue_mem");
        }
        Self::collect_closed(&mut inner);

        Some(CursorDrain {
            items,
            snap_start,
            snap_end,
            checkpoint_id,
        })
    }

    /// Drop closed checkpoints every cursor has fully passed.
    fn collect_closed(inner: &mut CmInner) {
        loop {
            let Some(front) = inner.checkpoints.front() else {
                return;
            };
            if front.open {
                return;
            }
            let front_id = front.id;
            let passed = inner
                .cursors
                .values()
                .all(|c| c.ckpt_id > front_id);
            if !passed {
                return;
            }
            inner.checkpoints.pop_front();
        }
    }

    /// Mutations still ahead of the given cursor.
    pub fn items_remaining(&self, cursor: &str) -> usize {
        let inner = self.inner.lock();
        let Some(pos) = inner.cursors.get(cursor) else {
            return 0;
        };
        let mut remaining = 0;
        for ckpt in inner.checkpoints.iter() {
            if ckpt.id < pos.ckpt_id {
                continue;
            }
            let start = if ckpt.id == pos.ckpt_id { pos.idx } else { 0 };
            remaining += ckpt.items[start.min(ckpt.items.len())..]
                .iter()
                .filter(|e| matches!(e.op, QueueOp::Mutation | QueueOp::Deletion))
                .count();
        }
        remaining
    }

    /// Bytes held by queued entries, for write back-pressure.
    pub fn queued_mem(&self) -> usize {
        self.inner.lock().queued_mem
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Checkpoint id the persistence cursor is currently inside.
    pub fn persistence_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .cursors
            .get(PERSISTENCE_CURSOR)
            .map(|c| c.ckpt_id)
            .unwrap_or(0)
    }

    /// Forget all queued entries; used on vbucket teardown so cursors do
    /// not hold freed checkpoints alive.
    pub fn clear(&self, high_seqno: u64) {
        let mut inner = self.inner.lock();
        let released = inner.queued_mem;
        let dropped: usize = inner
            .checkpoints
            .iter()
            .map(Checkpoint::num_mutations)
            .sum();
        inner.checkpoints.clear();
        inner.checkpoints.push_back(Checkpoint::new(1, high_seqno));
        inner.queued_mem = 0;
        for pos in inner.cursors.values_mut() {
            *pos = CursorPos { ckpt_id: 1, idx: 1 };
        }
        sub_guarded(&self.stats.diskqueue_items, dropped, "diskqueue_items");
        sub_guarded(&self.stats.diskqueue_mem, released, "diskqueue_mem");
    }
}

fn sub_guarded_mem(inner: &mut CmInner, released: usize) {
    inner.queued_mem = inner.queued_mem.saturating_sub(released);
}
