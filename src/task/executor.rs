use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use core::future::Future;
use core::task::{Context, Poll, Waker};

use crossbeam_queue::ArrayQueue;
use futures_util::task::{ArcWake, waker};
use log::{trace, warn};

use super::{Task, TaskId};
use crate::error::{Error, Result};

const READY_QUEUE_LEN: usize = 1024;

/// Round-robin executor for cooperative tasks
///
/// Foreground tasks keep [`run_until_complete`](Executor::run_until_complete)
/// going; background tasks (a timer service, say) only run alongside them.
pub struct Executor {
    tasks: BTreeMap<TaskId, Task>,
    foreground: BTreeSet<TaskId>,
    ready: Arc<ArrayQueue<TaskId>>,
    waker_cache: BTreeMap<TaskId, Waker>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            tasks: BTreeMap::new(),
            foreground: BTreeSet::new(),
            ready: Arc::new(ArrayQueue::new(READY_QUEUE_LEN)),
            waker_cache: BTreeMap::new(),
        }
    }

    pub fn spawn(&mut self, future: impl Future<Output = ()> + 'static) -> Result<TaskId> {
        let id = self.push(Task::new(future))?;
        self.foreground.insert(id);
        Ok(id)
    }

    pub fn spawn_background(&mut self, future: impl Future<Output = ()> + 'static) -> Result<TaskId> {
        self.push(Task::new(future))
    }

    fn push(&mut self, task: Task) -> Result<TaskId> {
        let id = task.id();
        if self.tasks.contains_key(&id) {
            return Err(Error::InvalidArg);
        }
        self.ready.push(id).map_err(|_| Error::QueueFull)?;
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Tasks that have not finished yet, background ones included
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_finished(&self, id: TaskId) -> bool {
        !self.tasks.contains_key(&id)
    }

    /// Poll one ready task; returns false when nothing was ready
    fn run_next(&mut self) -> bool {
        let Self {
            tasks,
            foreground,
            ready,
            waker_cache,
        } = self;

        let Some(id) = ready.pop() else {
            return false;
        };
        let Some(task) = tasks.get_mut(&id) else {
            // Woken after it finished.
            return true;
        };
        let waker = waker_cache
            .entry(id)
            .or_insert_with(|| TaskWaker::new(id, ready.clone()));
        let mut context = Context::from_waker(waker);
        if let Poll::Ready(()) = task.poll(&mut context) {
            trace!("[TASK] {:?} finished", id);
            tasks.remove(&id);
            waker_cache.remove(&id);
            foreground.remove(&id);
        }
        true
    }

    /// Run until every foreground task has finished
    ///
    /// Fails with `Stalled` when `max_polls` task polls were not enough, or
    /// when foreground tasks remain but none of them will ever be woken.
    pub fn run_until_complete(&mut self, max_polls: usize) -> Result<()> {
        let mut polls = 0;
        while !self.foreground.is_empty() {
            if polls == max_polls {
                warn!(
                    "[TASK] {} tasks still pending after {} polls",
                    self.foreground.len(),
                    polls
                );
                return Err(Error::Stalled);
            }
            if !self.run_next() {
                warn!("[TASK] {} tasks blocked with nothing ready", self.foreground.len());
                return Err(Error::Stalled);
            }
            polls += 1;
        }
        Ok(())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

struct TaskWaker {
    task_id: TaskId,
    ready: Arc<ArrayQueue<TaskId>>,
}

impl TaskWaker {
    fn new(task_id: TaskId, ready: Arc<ArrayQueue<TaskId>>) -> Waker {
        waker(Arc::new(TaskWaker { task_id, ready }))
    }
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.ready.push(arc_self.task_id).is_err() {
            warn!("[TASK] ready queue full; lost wake-up for {:?}", arc_self.task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::yield_now;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use spin::Mutex;

    #[test]
    fn test_tasks_interleave_at_yields() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = Executor::new();
        for name in ['a', 'b'] {
            let log = log.clone();
            executor
                .spawn(async move {
                    for round in 0..3 {
                        log.lock().push((name, round));
                        yield_now().await;
                    }
                })
                .unwrap();
        }
        executor.run_until_complete(100).unwrap();
        assert_eq!(
            *log.lock(),
            [('a', 0), ('b', 0), ('a', 1), ('b', 1), ('a', 2), ('b', 2)]
        );
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn test_background_task_does_not_block_completion() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut executor = Executor::new();
        let counter = polls.clone();
        executor
            .spawn_background(async move {
                loop {
                    counter.fetch_add(1, Ordering::Relaxed);
                    yield_now().await;
                }
            })
            .unwrap();
        let done = executor
            .spawn(async {
                yield_now().await;
            })
            .unwrap();

        executor.run_until_complete(100).unwrap();
        assert!(executor.is_finished(done));
        assert!(polls.load(Ordering::Relaxed) >= 1);
        assert_eq!(executor.task_count(), 1);
    }

    #[test]
    fn test_poll_budget_is_enforced() {
        let mut executor = Executor::new();
        executor
            .spawn(async {
                loop {
                    yield_now().await;
                }
            })
            .unwrap();
        assert_eq!(executor.run_until_complete(10), Err(Error::Stalled));
    }

    #[test]
    fn test_duplicate_task_id_is_refused() {
        let mut executor = Executor::new();
        let task = Task::new(async {});
        let id = task.id();
        executor.tasks.insert(id, Task::new(async {}));
        assert_eq!(executor.push(task).err(), Some(Error::InvalidArg));
        assert_eq!(executor.task_count(), 1);
        assert!(executor.ready.is_empty());
    }
}
