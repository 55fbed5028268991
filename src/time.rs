//! Monotonic time counter and waker-based timers.
//!
//! The hardware counter is modelled as an atomic the embedder (or a test)
//! advances; suspend timeouts are computed against it so repeated wakeups
//! never reset a deadline.

use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};

use alloc::collections::BTreeMap;

use crate::{config, spinlock::SpinLock};

pub struct Clock {
    counter: AtomicU64,
    timers: SpinLock<BTreeMap<(u64, u64), Waker>>,
    timer_seq: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            timers: SpinLock::new(BTreeMap::new()),
            timer_seq: AtomicU64::new(0),
        }
    }

    /// Current counter value, in ticks.
    pub fn time_counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Ticks per second.
    pub const fn frequency() -> u64 {
        config::TIME_COUNTER_FREQUENCY
    }

    pub const fn ticks_per_millisecond() -> u64 {
        Self::frequency() / 1000
    }

    /// Advances the counter and fires every timer that came due.
    pub fn advance(&self, ticks: u64) {
        let now = self.counter.fetch_add(ticks, Ordering::AcqRel) + ticks;
        let mut timers = self.timers.lock();
        let due: alloc::vec::Vec<(u64, u64)> = timers
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(waker) = timers.remove(&key) {
                waker.wake();
            }
        }
    }

    /// Completes once the counter reaches `deadline`.
    pub fn sleep_until(&self, deadline: u64) -> SleepFuture<'_> {
        SleepFuture {
            clock: self,
            deadline,
            key: None,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SleepFuture<'a> {
    clock: &'a Clock,
    deadline: u64,
    key: Option<(u64, u64)>,
}

impl Future for SleepFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.clock.time_counter() >= self.deadline {
            if let Some(key) = self.key.take() {
                self.clock.timers.lock().remove(&key);
            }
            return Poll::Ready(());
        }
        let key = match self.key {
            Some(key) => key,
            None => {
                let key = (
                    self.deadline,
                    self.clock.timer_seq.fetch_add(1, Ordering::Relaxed),
                );
                self.key = Some(key);
                key
            }
        };
        self.clock.timers.lock().insert(key, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for SleepFuture<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.clock.timers.lock().remove(&key);
        }
    }
}
