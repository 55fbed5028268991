use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, task::Wake};
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};
use crossbeam_queue::ArrayQueue;

const TASK_QUEUE_FULL: &str = "task_queue full";

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

type Tasks = BTreeMap<u64, (TaskFuture, Option<Waker>)>;

/// Runs spawned tasks in FIFO wake order until every task is parked.
pub struct FIFOExecutor<MutexType> {
    tasks: lock_api::Mutex<MutexType, Tasks>,
    task_queue: Arc<ArrayQueue<u64>>,
    next_id: AtomicU64,
}

impl<MutexType> FIFOExecutor<MutexType>
where
    MutexType: lock_api::RawMutex,
{
    pub fn new(queue_size: usize) -> Self {
        Self {
            tasks: lock_api::Mutex::new(BTreeMap::new()),
            task_queue: Arc::new(ArrayQueue::new(queue_size)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> u64 {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .insert(task_id, (Box::pin(fut), None));
        if self.task_queue.push(task_id).is_err() {
            panic!("{}", TASK_QUEUE_FULL);
        }
        task_id
    }

    /// Polls woken tasks until the wake queue drains. Tasks woken while
    /// running are processed in the same call.
    pub fn run_until_idle(&self) {
        while let Some(task_id) = self.task_queue.pop() {
            // The task is taken out of the map while polled so that its
            // wakers may reference the executor without deadlocking.
            let entry = self.tasks.lock().remove(&task_id);
            let (mut task, waker_opt) = match entry {
                Some(tup) => tup,
                None => continue,
            };

            let waker = match waker_opt {
                Some(waker) => waker,
                None => self.waker(task_id),
            };

            let mut context = Context::from_waker(&waker);
            if task.as_mut().poll(&mut context).is_pending() {
                self.tasks.lock().insert(task_id, (task, Some(waker)));
            }
        }
    }

    /// True if the task has run to completion (or was never spawned).
    pub fn is_done(&self, task_id: u64) -> bool {
        !self.tasks.lock().contains_key(&task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn waker(&self, task_id: u64) -> Waker {
        TaskWaker::new(task_id, self.task_queue.clone()).waker()
    }
}

struct TaskWaker {
    task_id: u64,
    task_queue: Arc<ArrayQueue<u64>>,
}

impl TaskWaker {
    fn new(task_id: u64, task_queue: Arc<ArrayQueue<u64>>) -> Self {
        Self {
            task_id,
            task_queue,
        }
    }

    fn waker(self) -> Waker {
        Waker::from(Arc::new(self))
    }

    fn wake_task(&self) {
        if self.task_queue.push(self.task_id).is_err() {
            panic!("{}", TASK_QUEUE_FULL);
        }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

#[cfg(test)]
mod test {
    use super::FIFOExecutor;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use alloc::sync::Arc;

    struct TestRawMutex(AtomicBool);

    unsafe impl lock_api::RawMutex for TestRawMutex {
        const INIT: Self = Self(AtomicBool::new(false));
        type GuardMarker = lock_api::GuardSend;

        fn lock(&self) {
            while !self.try_lock() {
                core::hint::spin_loop();
            }
        }

        fn try_lock(&self) -> bool {
            self.0
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        unsafe fn unlock(&self) {
            self.0.store(false, Ordering::Release);
        }
    }

    #[test]
    fn runs_spawned_tasks_to_completion() {
        let executor: FIFOExecutor<TestRawMutex> = FIFOExecutor::new(16);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let yielding = executor.spawn(async move {
            crate::yield_now().await;
            crate::yield_now().await;
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = ran.clone();
        let quick = executor.spawn(async move {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(executor.task_count(), 2);
        executor.run_until_idle();
        assert_eq!(ran.load(Ordering::Relaxed), 2);
        assert!(executor.is_done(yielding));
        assert!(executor.is_done(quick));
        assert_eq!(executor.task_count(), 0);
    }
}
