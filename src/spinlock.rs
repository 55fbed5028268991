use core::sync::atomic::{AtomicBool, Ordering};

/// A spin-based lock providing mutually exclusive access to data.
pub type SpinLock<T> = spin::Mutex<T>;

/// Raw spin mutex handed to `lock_api` consumers (the sleepable lock and
/// the executor park their state behind one of these).
pub struct RawSpinLock(spin::Mutex<()>);

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(spin::Mutex::new(()));
    type GuardMarker = lock_api::GuardSend;

    #[inline(always)]
    fn lock(&self) {
        <spin::Mutex<()> as lock_api::RawMutex>::lock(&self.0);
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        <spin::Mutex<()> as lock_api::RawMutex>::try_lock(&self.0)
    }

    #[inline(always)]
    unsafe fn unlock(&self) {
        <spin::Mutex<()> as lock_api::RawMutex>::unlock(&self.0);
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        <spin::Mutex<()> as lock_api::RawMutex>::is_locked(&self.0)
    }
}

/// A guardless spin flag.
///
/// Unlike `SpinLock` this can be held across suspension points; the holder
/// releases explicitly. Contending acquirers decide themselves whether to
/// spin, yield, or park (the tracer lock turns contention into a stop-event
/// wait).
pub struct SpinFlag(AtomicBool);

impl SpinFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the flag, yielding to the executor between attempts.
    pub async fn acquire(&self) {
        while !self.try_acquire() {
            executor::yield_now().await;
        }
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for SpinFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::SpinFlag;

    #[test]
    fn spin_flag_exclusive() {
        let flag = SpinFlag::new();
        assert!(flag.try_acquire());
        assert!(!flag.try_acquire());
        flag.release();
        assert!(flag.try_acquire());
    }
}
