//! Architecture trap-frame model.
//!
//! The real machine context is opaque to the delivery subsystem; it only
//! reads the instruction pointer, arms or clears single-step, and swaps the
//! frame when a handler is entered or returned from.

use alloc::sync::Arc;

use crate::proc::{
    signal::{self, SignalParameters, Signo},
    Thread,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    pub single_step: bool,
}

/// The machine state saved on signal entry and restored by the
/// restore-context system call.
#[derive(Debug, Clone, Copy)]
pub struct PreSignalContext {
    pub trap: TrapFrame,
    pub signal: Signo,
}

pub fn instruction_pointer(trap_frame: &TrapFrame) -> usize {
    trap_frame.instruction_pointer
}

pub fn set_or_clear_single_step(trap_frame: &mut TrapFrame, enable: bool) {
    trap_frame.single_step = enable;
}

/// Applies a dequeued signal to the current thread: runs the default action
/// if one applies, otherwise redirects the trap frame into the user-mode
/// handler trampoline, saving the interrupted context for restore.
pub async fn apply_synchronous_signal(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
    params: &SignalParameters,
) {
    let signo = match params.number {
        Some(signo) => signo,
        None => return,
    };

    if signal::attempt_default_processing(thread, signo).await {
        return;
    }

    let proc = thread.proc();
    let handler = {
        let sig = proc.queued().lock().await;
        let handler = sig.handler;
        if handler.is_some() {
            // The signal runs on this thread's stack until the handler
            // returns.
            unsafe { thread.sig.assume_locked() }.running.add(signo);
        }
        drop(sig);
        handler
    };

    let handler = match handler {
        Some(handler) => handler,
        // The trampoline disappeared between default processing and here;
        // nothing to transfer to.
        None => return,
    };

    let mut inner = thread.inner.lock();
    inner.pre_signal.push(PreSignalContext {
        trap: *trap_frame,
        signal: signo,
    });
    trap_frame.instruction_pointer = handler;
}

/// Restores the trap frame saved when the most recent signal was applied.
/// Returns the signal that was being serviced.
pub fn restore_pre_signal_trap_frame(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
) -> Option<Signo> {
    let saved = thread.inner.lock().pre_signal.pop()?;
    *trap_frame = saved.trap;
    Some(saved.signal)
}
