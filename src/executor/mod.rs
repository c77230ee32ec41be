pub mod queue;
pub mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use self::queue::{TaskQueue, ThreadCtl, ThreadState};
use self::task::{GlobalTask, TaskHandle, TaskState, TaskType, NUM_TASK_TYPES};

/// Thread counts per task type.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCounts {
    pub writers: usize,
    pub readers: usize,
    pub auxio: usize,
    pub nonio: usize,
}

impl Default for ThreadCounts {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            writers: cpus.clamp(1, 4),
            readers: cpus.clamp(1, 4),
            auxio: 1,
            nonio: 1,
        }
    }
}

struct Worker {
    ctl: Arc<ThreadCtl>,
    join: JoinHandle<()>,
}

/// Process-wide cooperative scheduler: one queue per task type, a fixed
/// set of worker threads per queue, each running a fetch-execute loop.
pub struct ExecutorPool {
    queues: [Arc<TaskQueue>; NUM_TASK_TYPES],
    workers: Mutex<Vec<Worker>>,
    next_task_id: AtomicU64,
}

impl ExecutorPool {
    pub fn new(counts: ThreadCounts) -> Arc<Self> {
        let queues = [
            Arc::new(TaskQueue::new(TaskType::Writer)),
            Arc::new(TaskQueue::new(TaskType::Reader)),
            Arc::new(TaskQueue::new(TaskType::AuxIO)),
            Arc::new(TaskQueue::new(TaskType::NonIO)),
        ];

        let pool = Arc::new(Self {
            queues,
            workers: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
        });

        let plan = [
            (TaskType::Writer, counts.writers),
            (TaskType::Reader, counts.readers),
            (TaskType::AuxIO, counts.auxio),
            (TaskType::NonIO, counts.nonio),
        ];
        let mut workers = pool.workers.lock();
        for (ty, n) in plan {
            for _ in 0..n.max(1) {
                let queue = pool.queues[ty.index()].clone();
                let ctl = Arc::new(ThreadCtl::new());
                let thread_ctl = ctl.clone();
                let join = std::thread::spawn(move || {
                    worker_loop(queue, thread_ctl);
                });
                workers.push(Worker { ctl, join });
            }
        }
        drop(workers);

        pool
    }

    fn queue_for(&self, ty: TaskType) -> &Arc<TaskQueue> {
        &self.queues[ty.index()]
    }

    /// Create and schedule a task, to first run after `initial_delay`.
    pub fn schedule(&self, task: Box<dyn GlobalTask>, initial_delay: Duration) -> Arc<TaskHandle> {
        let id = self.next_task_id.fetch_add(1, Ordering::AcqRel);
        let handle = Arc::new(TaskHandle::new(id, task, Instant::now() + initial_delay));
        self.schedule_handle(handle.clone());
        handle
    }

    /// (Re)schedule an existing handle.
    pub fn schedule_handle(&self, handle: Arc<TaskHandle>) {
        let ty = handle.task.task_type();
        self.queue_for(ty).schedule(handle);
    }

    /// Bring the task's waketime to now and signal its queue.
    pub fn wake(&self, handle: &Arc<TaskHandle>) {
        let ty = handle.task.task_type();
        self.queue_for(ty).wake(handle);
    }

    /// Mark the task dead; the next pop reaps it.
    pub fn cancel(&self, handle: &Arc<TaskHandle>) {
        handle.set_dead();
        let ty = handle.task.task_type();
        self.queue_for(ty).wake(handle);
    }

    /// Stop every worker; outstanding tasks are discarded with the queues.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter() {
            worker.ctl.mark_dead();
        }
        for queue in &self.queues {
            queue.shutdown_broadcast();
        }
        let me = std::thread::current().id();
        for worker in workers.drain(..) {
            // a task dropping the last engine handle runs shutdown on its
            // own worker thread; that thread exits on the dead flag and
            // must not join itself
            if worker.join.thread().id() == me {
                continue;
            }
            if worker.join.join().is_err() {
                tracing::error!("executor worker panicked during shutdown");
            }
        }
    }

    pub fn queue_sizes(&self, ty: TaskType) -> (usize, usize, usize) {
        let q = self.queue_for(ty);
        (q.ready_len(), q.future_len(), q.pending_len())
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: Arc<TaskQueue>, ctl: Arc<ThreadCtl>) {
    let mut to_sleep = false;
    loop {
        if ctl.state() == ThreadState::Dead {
            break;
        }
        match queue.fetch_next_task(&ctl, to_sleep) {
            Some(handle) => {
                to_sleep = false;
                if handle.is_dead() {
                    // reaped; dropping the queue's reference frees it
                    tracing::debug!(
                        id = handle.id(),
                        description = %handle.task.description(),
                        "reaped dead task"
                    );
                    continue;
                }
                let _ = handle.transition(TaskState::Running, TaskState::Snoozed);
                let run_again = handle.task.run(&handle);
                if run_again && !handle.is_dead() {
                    queue.reschedule(handle);
                } else {
                    handle.set_dead();
                }
            }
            None => {
                if ctl.state() == ThreadState::Dead {
                    break;
                }
                to_sleep = true;
            }
        }
    }
    tracing::debug!(queue = queue.task_type().label(), "executor worker exit");
}
