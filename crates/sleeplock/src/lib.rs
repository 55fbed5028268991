//! Sleepable synchronization primitives for cooperative kernel threads.
//!
//! `Mutex` is a queued lock: contending waiters park their wakers in FIFO
//! order and releasing the lock wakes the head of the queue. `Event` is a
//! level-triggered notification that stays signaled until explicitly reset.

#![no_std]

extern crate alloc;

use core::{
    cell::UnsafeCell,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use alloc::collections::VecDeque;

pub struct Mutex<R, T: ?Sized> {
    state: lock_api::Mutex<R, LockState>,
    value: UnsafeCell<T>,
}

struct LockState {
    locked: bool,
    waiters: VecDeque<Waker>,
}

unsafe impl<R: lock_api::RawMutex + Send, T: ?Sized + Send> Send for Mutex<R, T> {}
unsafe impl<R: lock_api::RawMutex + Sync, T: ?Sized + Send> Sync for Mutex<R, T> {}

impl<R: lock_api::RawMutex, T> Mutex<R, T> {
    pub fn new(value: T) -> Self {
        Self {
            state: lock_api::Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexLockFuture<'_, R, T> {
        MutexLockFuture { mutex: self }
    }

    /// Acquires the lock only if no one holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, R, T>> {
        let mut state = self.state.lock();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }
}

pub struct MutexGuard<'a, R: lock_api::RawMutex, T: ?Sized> {
    mutex: &'a Mutex<R, T>,
}

impl<'a, R: lock_api::RawMutex, T: ?Sized> Drop for MutexGuard<'a, R, T> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock();
        state.locked = false;
        // Hand the wake to the head of the queue. The woken future
        // re-acquires on its next poll.
        if let Some(waker) = state.waiters.pop_front() {
            waker.wake()
        }
    }
}

impl<'a, R: lock_api::RawMutex, T> core::ops::Deref for MutexGuard<'a, R, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, R: lock_api::RawMutex, T> core::ops::DerefMut for MutexGuard<'a, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

pub struct MutexLockFuture<'a, R, T> {
    mutex: &'a Mutex<R, T>,
}

impl<'a, R: lock_api::RawMutex, T> Future for MutexLockFuture<'a, R, T> {
    type Output = MutexGuard<'a, R, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut state = self.mutex.state.lock();
        if state.locked {
            if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
                state.waiters.push_back(cx.waker().clone());
            }
            Poll::Pending
        } else {
            state.locked = true;
            Poll::Ready(MutexGuard { mutex: self.mutex })
        }
    }
}

/// A level-triggered event.
///
/// `wait` completes immediately while the event is signaled. `signal_all`
/// releases every waiter and leaves the event signaled until `unsignal`.
pub struct Event<R> {
    state: lock_api::Mutex<R, EventState>,
}

struct EventState {
    signaled: bool,
    waiters: VecDeque<Waker>,
}

impl<R: lock_api::RawMutex> Event<R> {
    pub fn new(signaled: bool) -> Self {
        Self {
            state: lock_api::Mutex::new(EventState {
                signaled,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn signal_all(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        for waker in state.waiters.drain(..) {
            waker.wake();
        }
    }

    pub fn unsignal(&self) {
        self.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn wait(&self) -> EventWaitFuture<'_, R> {
        EventWaitFuture { event: self }
    }
}

pub struct EventWaitFuture<'a, R> {
    event: &'a Event<R>,
}

impl<'a, R: lock_api::RawMutex> Future for EventWaitFuture<'a, R> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut state = self.event.state.lock();
        if state.signaled {
            Poll::Ready(())
        } else {
            if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
                state.waiters.push_back(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Event, Mutex};
    use core::{
        future::Future,
        pin::Pin,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        task::{Context, Poll, Waker},
    };

    use alloc::{sync::Arc, task::Wake};

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

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (counter.clone(), Waker::from(counter))
    }

    #[test]
    fn mutex_parks_and_wakes_in_order() {
        let mutex: Mutex<TestRawMutex, u32> = Mutex::new(7);
        let guard = mutex.try_lock().expect("uncontended");
        assert!(mutex.try_lock().is_none());

        let (first, first_waker) = waker();
        let mut contender = mutex.lock();
        assert!(Pin::new(&mut contender)
            .poll(&mut Context::from_waker(&first_waker))
            .is_pending());

        // Releasing hands the wake to the queue head.
        drop(guard);
        assert_eq!(first.0.load(Ordering::Relaxed), 1);
        match Pin::new(&mut contender).poll(&mut Context::from_waker(&first_waker)) {
            Poll::Ready(mut guard) => *guard = 8,
            Poll::Pending => panic!("lock was free"),
        }
        assert_eq!(*mutex.try_lock().expect("released"), 8);
    }

    #[test]
    fn event_is_level_triggered() {
        let event: Event<TestRawMutex> = Event::new(false);
        let (counter, test_waker) = waker();
        let mut wait = event.wait();
        assert!(Pin::new(&mut wait)
            .poll(&mut Context::from_waker(&test_waker))
            .is_pending());

        event.signal_all();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert!(Pin::new(&mut wait)
            .poll(&mut Context::from_waker(&test_waker))
            .is_ready());

        // Stays signaled until reset.
        assert!(Pin::new(&mut event.wait())
            .poll(&mut Context::from_waker(&test_waker))
            .is_ready());
        event.unsignal();
        assert!(Pin::new(&mut event.wait())
            .poll(&mut Context::from_waker(&test_waker))
            .is_pending());
    }
}
