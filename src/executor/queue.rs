use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::constants::MIN_SLEEP_TIME;
use crate::executor::task::{TaskHandle, TaskKind, TaskState, TaskType};

/// Worker thread lifecycle, shared with the queue so shutdown can race
/// the sleep path deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Sleeping = 1,
    Dead = 2,
}

pub struct ThreadCtl {
    state: AtomicU8,
    waketime: Mutex<Instant>,
}

impl ThreadCtl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ThreadState::Running as u8),
            waketime: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Running,
            1 => ThreadState::Sleeping,
            _ => ThreadState::Dead,
        }
    }

    fn transition(&self, to: ThreadState, from: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_dead(&self) {
        self.state.store(ThreadState::Dead as u8, Ordering::Release);
    }

    fn waketime(&self) -> Instant {
        *self.waketime.lock()
    }

    fn set_waketime(&self, at: Instant) {
        *self.waketime.lock() = at;
    }
}

impl Default for ThreadCtl {
    fn default() -> Self {
        Self::new()
    }
}

struct ReadyEntry {
    priority: u8,
    seq: u64,
    handle: Arc<TaskHandle>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyEntry {}

impl Ord for ReadyEntry {
    // max-heap: lower priority value pops first, FIFO within a priority
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    ready: BinaryHeap<ReadyEntry>,
    future: Vec<Arc<TaskHandle>>,
    pending: VecDeque<Arc<TaskHandle>>,
    sleepers: usize,
    fifo_seq: u64,
}

/// One logical queue per task type: `ready` holds priority-ordered
/// runnable tasks, `future` tasks whose waketime has not arrived, and
/// `pending` temporarily blocked tasks.
pub struct TaskQueue {
    ty: TaskType,
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new(ty: TaskType) -> Self {
        Self {
            ty,
            inner: Mutex::new(QueueInner {
                ready: BinaryHeap::new(),
                future: Vec::new(),
                pending: VecDeque::new(),
                sleepers: 0,
                fifo_seq: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.ty
    }

    /// Schedule a task into the future queue. Rescheduling a previously
    /// cancelled task re-arms it as Running; that is tolerated only for
    /// the item pager, anything else is a logic error and aborts.
    pub fn schedule(&self, handle: Arc<TaskHandle>) {
        let revived = handle.transition(TaskState::Running, TaskState::Dead);
        if revived && handle.task.kind() != TaskKind::ItemPager {
            panic!(
                "dead task scheduled: queue={} id={} description={}",
                self.ty.label(),
                handle.id(),
                handle.task.description()
            );
        }

        tracing::debug!(
            queue = self.ty.label(),
            id = handle.id(),
            description = %handle.task.description(),
            "schedule task"
        );

        let mut inner = self.inner.lock();
        inner.future.push(handle);
        Self::do_wake_locked(&mut inner, &self.cv, 1);
    }

    /// Re-arm a task after a `run` that asked to continue.
    pub fn reschedule(&self, handle: Arc<TaskHandle>) {
        let mut inner = self.inner.lock();
        inner.future.push(handle);
        Self::do_wake_locked(&mut inner, &self.cv, 1);
    }

    /// Make the task runnable now, wherever it currently waits.
    pub fn wake(&self, handle: &Arc<TaskHandle>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // pending entries for this task (or dead ones) re-enter the future
        // queue so the ready path reaps or runs them in priority order
        let mut not_ready: Vec<Arc<TaskHandle>> = Vec::new();
        inner.pending.retain(|t| {
            if t.id() == handle.id() || t.is_dead() {
                not_ready.push(t.clone());
                false
            } else {
                true
            }
        });

        handle.set_waketime(now);
        let _ = handle.transition(TaskState::Running, TaskState::Snoozed);

        let mut ready_count = 1usize;
        for t in not_ready {
            if t.waketime() <= now || t.is_dead() {
                ready_count += 1;
            }
            inner.future.push(t);
        }

        if !inner.future.iter().any(|t| t.id() == handle.id())
            && !inner.ready.iter().any(|e| e.handle.id() == handle.id())
        {
            inner.future.push(handle.clone());
        }

        Self::do_wake_locked(&mut inner, &self.cv, ready_count);
    }

    /// The worker fetch loop. With `to_sleep`, waits (bounded by
    /// MIN_SLEEP_TIME) until the earliest waketime; returns None when the
    /// sleep was interrupted by shutdown or nothing is runnable.
    pub fn fetch_next_task(&self, thread: &ThreadCtl, to_sleep: bool) -> Option<Arc<TaskHandle>> {
        let mut inner = self.inner.lock();

        if to_sleep && !self.do_sleep(&mut inner, thread) {
            return None; // shutting down
        }

        let now = Instant::now();
        let mut num_to_wake = Self::move_ready_tasks(&mut inner, now);

        // record the earliest future waketime for the next sleep
        if let Some(earliest) = inner.future.iter().map(|t| t.waketime()).min() {
            if earliest < thread.waketime() {
                thread.set_waketime(earliest);
            }
        }

        let fetched = if inner
            .ready
            .peek()
            .map(|e| e.handle.is_dead())
            .unwrap_or(false)
        {
            // clean out dead tasks first
            inner.ready.pop().map(|e| e.handle)
        } else if !inner.ready.is_empty() || !inner.pending.is_empty() {
            Self::check_pending_queue(&mut inner);
            inner.ready.pop().map(|e| e.handle)
        } else {
            num_to_wake = num_to_wake.saturating_sub(1);
            None
        };

        Self::do_wake_locked(&mut inner, &self.cv, num_to_wake);
        fetched
    }

    fn do_sleep(&self, inner: &mut MutexGuard<'_, QueueInner>, thread: &ThreadCtl) -> bool {
        let now = Instant::now();
        let waketime = thread.waketime();
        if now < waketime {
            // atomically switch from running to sleeping, iff we were
            // previously running; shutdown may have raced us
            if !thread.transition(ThreadState::Sleeping, ThreadState::Running) {
                return false;
            }
            inner.sleepers += 1;

            let snooze = waketime - now;
            let timeout = snooze.min(MIN_SLEEP_TIME);
            self.cv.wait_for(inner, timeout);
            inner.sleepers -= 1;

            if !thread.transition(ThreadState::Running, ThreadState::Sleeping) {
                return false;
            }
        }
        thread.set_waketime(now + Duration::from_secs(60 * 60 * 24));
        true
    }

    /// Bulk-move matured future tasks onto the ready heap; returns how
    /// many other sleepers should be woken (the caller pops one itself).
    fn move_ready_tasks(inner: &mut QueueInner, now: Instant) -> usize {
        if !inner.ready.is_empty() {
            return 0;
        }
        let mut num_ready: usize = 0;
        let mut idx = 0;
        while idx < inner.future.len() {
            if inner.future[idx].waketime() <= now {
                let handle = inner.future.swap_remove(idx);
                let _ = handle.transition(TaskState::Running, TaskState::Snoozed);
                inner.fifo_seq += 1;
                let entry = ReadyEntry {
                    priority: handle.task.priority(),
                    seq: inner.fifo_seq,
                    handle,
                };
                inner.ready.push(entry);
                num_ready += 1;
            } else {
                idx += 1;
            }
        }
        num_ready.saturating_sub(1)
    }

    /// Promote one blocked task so prioritized ordering still holds.
    fn check_pending_queue(inner: &mut QueueInner) {
        if let Some(handle) = inner.pending.pop_front() {
            inner.fifo_seq += 1;
            let entry = ReadyEntry {
                priority: handle.task.priority(),
                seq: inner.fifo_seq,
                handle,
            };
            inner.ready.push(entry);
        }
    }

    /// Park a task as temporarily blocked.
    pub fn push_pending(&self, handle: Arc<TaskHandle>) {
        let mut inner = self.inner.lock();
        inner.pending.push_back(handle);
    }

    fn do_wake_locked(inner: &mut QueueInner, cv: &Condvar, num_to_wake: usize) {
        if inner.sleepers > 0 && num_to_wake > 0 {
            if num_to_wake < inner.sleepers {
                for _ in 0..num_to_wake {
                    cv.notify_one();
                }
            } else {
                cv.notify_all();
            }
        }
    }

    /// Broadcast so sleeping workers observe shutdown.
    pub fn shutdown_broadcast(&self) {
        let _inner = self.inner.lock();
        self.cv.notify_all();
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn future_len(&self) -> usize {
        self.inner.lock().future.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
