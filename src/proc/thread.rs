use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    task::{Context, Poll, Waker},
};

use alloc::{collections::VecDeque, string::String, sync::Arc};

use crate::{
    arch::PreSignalContext,
    proc::{
        signal::{AtomicSignalSet, SignalQueueEntry, SignalSet},
        Identity, Proc, Tid,
    },
    spinlock::SpinLock,
};

// Unknown forces a full dequeue pass and is what mask changes publish;
// ChildOnly wakes only suspended threads. Producers may only raise.
num_enum::num_enum!(pub SignalPendingState: u8 {
    Unknown = 0,
    None = 1,
    ChildOnly = 2,
    Any = 3,
});

/// Thread signal state guarded by the owning process's queued lock.
pub struct ThreadSig {
    /// Per-thread mask of deferred signals. Never contains stop or kill.
    pub blocked: SignalSet,
    /// Signals currently being serviced on this thread's stack.
    pub running: SignalSet,
    /// Queue entries directed at this thread.
    pub queue: VecDeque<Arc<SignalQueueEntry>>,
}

pub struct Thread {
    tid: Tid,
    name: String,
    // The process backref is bound once right after construction.
    proc: spin::Once<Arc<Proc>>,
    pub identity: Identity,
    /// One of `SignalPendingState`, raised by producers and downgraded only
    /// by the dequeue path.
    signal_pending: AtomicU8,
    /// Standard signals posted to this thread. Mutated under the process
    /// queued lock, readable on the lock-free fast path.
    pub pending: AtomicSignalSet,
    /// Lock-free hint that `sig.queue` is non-empty.
    pub queue_nonempty: AtomicBool,
    /// The caller must hold the process queued lock.
    pub sig: MaybeUnlock<ThreadSig>,
    wait: WaitCell,
    pub inner: SpinLock<ThreadInner>,
    exited: AtomicBool,
}

pub struct ThreadInner {
    /// Contexts saved on signal handler entry, restored on return.
    pub pre_signal: alloc::vec::Vec<PreSignalContext>,
}

impl Thread {
    pub fn new(tid: Tid, name: impl Into<String>, identity: Identity) -> Self {
        Self {
            tid,
            name: name.into(),
            proc: spin::Once::new(),
            identity,
            signal_pending: AtomicU8::new(SignalPendingState::Unknown.to_primitive()),
            pending: AtomicSignalSet::new(),
            queue_nonempty: AtomicBool::new(false),
            sig: MaybeUnlock::new(ThreadSig {
                blocked: SignalSet::empty(),
                running: SignalSet::empty(),
                queue: VecDeque::new(),
            }),
            wait: WaitCell::new(),
            inner: SpinLock::new(ThreadInner {
                pre_signal: alloc::vec::Vec::new(),
            }),
            exited: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind_proc(&self, proc: Arc<Proc>) {
        self.proc.call_once(|| proc);
    }

    pub fn proc(&self) -> &Arc<Proc> {
        self.proc.get().expect("thread not bound to a process")
    }

    pub fn signal_pending_state(&self) -> SignalPendingState {
        SignalPendingState::from_primitive(self.signal_pending.load(Ordering::Acquire))
            .unwrap_or(SignalPendingState::Unknown)
    }

    pub fn set_signal_pending_state(&self, state: SignalPendingState) {
        self.signal_pending
            .store(state.to_primitive(), Ordering::Release);
    }

    /// Raises the pending state, never lowering it. Producers use this; the
    /// dequeue path is the only downgrader.
    pub fn raise_signal_pending(&self, state: SignalPendingState) {
        self.signal_pending
            .fetch_max(state.to_primitive(), Ordering::AcqRel);
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn set_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub(crate) fn sync_queue_hint(&self) {
        // Caller holds the process queued lock.
        let empty = unsafe { self.sig.assume_locked() }.queue.is_empty();
        self.queue_nonempty.store(!empty, Ordering::Release);
    }

    /// Suspends until woken. A wake that raced ahead of the suspend is not
    /// lost; it completes the next suspend immediately.
    pub fn suspend(&self) -> WaitFuture<'_> {
        self.wait.wait(WaitKind::Suspended)
    }

    /// An interruptible sleep that is not a suspension; child-only wakes
    /// skip it.
    pub fn interruptible_block(&self) -> WaitFuture<'_> {
        self.wait.wait(WaitKind::Blocked)
    }

    /// Wakes the thread out of an interruptible wait. With `only_suspended`
    /// set, threads that are merely blocked (or running) are left alone.
    pub fn wake(&self, only_suspended: bool) {
        self.wait.wake(only_suspended)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Running,
    Blocked,
    Suspended,
}

struct WaitState {
    kind: WaitKind,
    token: bool,
    waker: Option<Waker>,
}

/// Per-thread interruptible wait slot: at most one suspend or block at a
/// time, with a sticky wake token so a wake delivered between the pending
/// check and the sleep is never lost.
struct WaitCell {
    state: SpinLock<WaitState>,
}

impl WaitCell {
    fn new() -> Self {
        Self {
            state: SpinLock::new(WaitState {
                kind: WaitKind::Running,
                token: false,
                waker: None,
            }),
        }
    }

    fn wait(&self, kind: WaitKind) -> WaitFuture<'_> {
        WaitFuture { cell: self, kind }
    }

    fn wake(&self, only_suspended: bool) {
        let mut state = self.state.lock();
        match state.kind {
            WaitKind::Suspended => {
                state.token = true;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            }
            WaitKind::Blocked | WaitKind::Running => {
                if !only_suspended {
                    state.token = true;
                    if let Some(waker) = state.waker.take() {
                        waker.wake();
                    }
                }
            }
        }
    }
}

pub struct WaitFuture<'a> {
    cell: &'a WaitCell,
    kind: WaitKind,
}

impl Future for WaitFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.cell.state.lock();
        if state.token {
            state.token = false;
            state.kind = WaitKind::Running;
            state.waker = None;
            Poll::Ready(())
        } else {
            state.kind = self.kind;
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock();
        state.kind = WaitKind::Running;
        state.waker = None;
    }
}

/// Wrapper for state whose lock lives elsewhere (the process queued lock
/// guards the thread members it protects).
pub struct MaybeUnlock<T: ?Sized>(core::cell::UnsafeCell<T>);

unsafe impl<T: ?Sized + Send> Send for MaybeUnlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for MaybeUnlock<T> {}

impl<T> MaybeUnlock<T> {
    pub fn new(value: T) -> Self {
        Self(core::cell::UnsafeCell::new(value))
    }

    /// # Safety
    ///
    /// The caller must hold the lock that guards this state for the full
    /// lifetime of the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn assume_locked(&self) -> &mut T {
        &mut *self.0.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proc::Identity;

    #[test]
    fn pending_state_is_monotonic() {
        let thread = Thread::new(1, "t", Identity::user(1));
        thread.raise_signal_pending(SignalPendingState::ChildOnly);
        assert_eq!(
            thread.signal_pending_state(),
            SignalPendingState::ChildOnly
        );
        thread.raise_signal_pending(SignalPendingState::Any);
        assert_eq!(thread.signal_pending_state(), SignalPendingState::Any);
        // A raise never lowers the state.
        thread.raise_signal_pending(SignalPendingState::ChildOnly);
        assert_eq!(thread.signal_pending_state(), SignalPendingState::Any);
    }

    #[test]
    fn early_wake_is_not_lost() {
        let thread = Thread::new(2, "t", Identity::user(1));
        thread.wake(false);
        // The wake arrived before the suspend; the suspend completes at
        // once.
        executor::block_on(thread.suspend());
    }

    #[test]
    fn child_only_wake_skips_blocked_threads() {
        use core::{future::Future, pin::Pin, task::Context};

        let thread = Thread::new(3, "t", Identity::user(1));
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut block = thread.interruptible_block();
        assert!(Pin::new(&mut block).poll(&mut cx).is_pending());
        thread.wake(true);
        assert!(Pin::new(&mut block).poll(&mut cx).is_pending());
        thread.wake(false);
        assert!(Pin::new(&mut block).poll(&mut cx).is_ready());
        drop(block);

        let mut suspend = thread.suspend();
        assert!(Pin::new(&mut suspend).poll(&mut cx).is_pending());
        thread.wake(true);
        assert!(Pin::new(&mut suspend).poll(&mut cx).is_ready());
    }
}
