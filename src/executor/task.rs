use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type TaskId = u64;

/// Which worker group services a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Writer,
    Reader,
    AuxIO,
    NonIO,
}

pub const NUM_TASK_TYPES: usize = 4;

impl TaskType {
    pub fn index(self) -> usize {
        match self {
            TaskType::Writer => 0,
            TaskType::Reader => 1,
            TaskType::AuxIO => 2,
            TaskType::NonIO => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskType::Writer => "Writer",
            TaskType::Reader => "Reader",
            TaskType::AuxIO => "AuxIO",
            TaskType::NonIO => "NonIO",
        }
    }
}

/// Stable identity of the component behind a task; the scheduler treats
/// the item pager's dead-reschedule quirk specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Flusher,
    BgFetcher,
    ItemPager,
    ExpiryPager,
    HtResizer,
    Defragmenter,
    AccessScanner,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Snoozed = 1,
    Dead = 2,
}

fn state_from_u8(v: u8) -> TaskState {
    match v {
        0 => TaskState::Running,
        1 => TaskState::Snoozed,
        _ => TaskState::Dead,
    }
}

/// A schedulable unit of background work. `run` returns true to be
/// rescheduled at the handle's waketime (set via [`TaskHandle::snooze`]),
/// false to die.
pub trait GlobalTask: Send + Sync {
    fn run(&self, handle: &TaskHandle) -> bool;

    fn description(&self) -> String;

    fn task_type(&self) -> TaskType;

    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    /// Lower runs first among equally ready tasks.
    fn priority(&self) -> u8 {
        5
    }
}

/// Shared handle for one task, owned jointly by the pool's queues and the
/// component that scheduled it.
pub struct TaskHandle {
    id: TaskId,
    state: AtomicU8,
    waketime: Mutex<Instant>,
    pub task: Box<dyn GlobalTask>,
}

impl TaskHandle {
    pub fn new(id: TaskId, task: Box<dyn GlobalTask>, waketime: Instant) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::Running as u8),
            waketime: Mutex::new(waketime),
            task,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// CAS the state; true when the transition happened.
    pub fn transition(&self, to: TaskState, from: TaskState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn set_dead(&self) {
        self.state.store(TaskState::Dead as u8, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.state() == TaskState::Dead
    }

    pub fn waketime(&self) -> Instant {
        *self.waketime.lock()
    }

    pub fn set_waketime(&self, at: Instant) {
        *self.waketime.lock() = at;
    }

    /// Called from within `run` to pick the next waketime.
    pub fn snooze(&self, duration: Duration) {
        self.set_waketime(Instant::now() + duration);
        let _ = self.transition(TaskState::Snoozed, TaskState::Running);
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("description", &self.task.description())
            .finish()
    }
}
