#![no_std]

extern crate alloc;

use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll, Waker},
};

use alloc::{sync::Arc, task::Wake};

// executor implementation
// Reference https://os.phil-opp.com/async-await

#[cfg(feature = "fifo")]
pub mod fifo;

/// Yields once, waking the task again immediately.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

struct BlockOnWaker {
    wake_times: Arc<AtomicUsize>,
}

impl Wake for BlockOnWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_times.fetch_add(1, Ordering::Release);
    }
}

/// Drives a future to completion on the calling thread.
///
/// With no other task running, a future that returns `Pending` without
/// arranging its own wake can never complete, so that case panics instead
/// of hanging.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let wake_times = Arc::new(AtomicUsize::new(1));
    let waker = Waker::from(Arc::new(BlockOnWaker {
        wake_times: wake_times.clone(),
    }));
    let mut cx = Context::from_waker(&waker);
    let mut fut = fut;
    // The future lives on this stack frame and is never moved again.
    let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(out) => return out,
            Poll::Pending => {
                if wake_times.fetch_sub(1, Ordering::AcqRel) == 1
                    && wake_times.load(Ordering::Acquire) == 0
                {
                    panic!("block_on: future is pending with no pending wake");
                }
            }
        }
    }
}
