use crate::spinlock;

/// The per-process queued lock. Contending threads sleep in FIFO order
/// rather than spinning.
pub type QueuedLock<T> = sleeplock::Mutex<spinlock::RawSpinLock, T>;

#[allow(dead_code)]
pub type QueuedLockFuture<'a, T> = sleeplock::MutexLockFuture<'a, spinlock::RawSpinLock, T>;

pub type QueuedLockGuard<'a, T> = sleeplock::MutexGuard<'a, spinlock::RawSpinLock, T>;

/// Level-triggered scheduler event (`stopEvent`, `allStoppedEvent`).
pub type Event = sleeplock::Event<spinlock::RawSpinLock>;
