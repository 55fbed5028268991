//! Tracer interposition.
//!
//! With a debugger attached, every signal headed for delivery detours
//! through here: the tracee's threads are collected at the stop barrier,
//! one thread (the debug leader) reports to the tracer, and the tracer's
//! verdict replaces, suppresses, or passes the signal.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::{Arc, Weak};

use crate::{
    arch::{self, TrapFrame},
    proc::{
        process::Proc,
        signal::{
            self, dequeue, ChildSignalReason, SignalParameters, Signo,
            KERNEL_REPORTED_USER_SIGNALS,
        },
        thread::Thread,
        Tid,
    },
    sleeplock::Event,
    spinlock::{SpinFlag, SpinLock},
};

num_enum::num_enum!(pub DebugCommand: u8 {
    Invalid = 0,
    Continue = 1,
    SingleStep = 2,
    RangeStep = 3,
});

/// Instruction-pointer window for range stepping: break inside
/// `[start, end)` except within the hole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakRange {
    pub start: usize,
    pub end: usize,
    pub hole_start: usize,
    pub hole_end: usize,
}

struct DebugState {
    command: DebugCommand,
    previous_command: DebugCommand,
    break_range: BreakRange,
    signal_information: SignalParameters,
    leader: Option<Tid>,
}

pub struct DebugData {
    /// Admits one tracee thread to the protocol at a time.
    pub tracer_lock: SpinFlag,
    tracing_process: SpinLock<Option<Weak<Proc>>>,
    tracer_stop_requested: AtomicBool,
    state: SpinLock<DebugState>,
    pub all_stopped_event: Event,
}

impl DebugData {
    pub fn new() -> Self {
        Self {
            tracer_lock: SpinFlag::new(),
            tracing_process: SpinLock::new(None),
            tracer_stop_requested: AtomicBool::new(false),
            state: SpinLock::new(DebugState {
                command: DebugCommand::Invalid,
                previous_command: DebugCommand::Invalid,
                break_range: BreakRange::default(),
                signal_information: SignalParameters::default(),
                leader: None,
            }),
            all_stopped_event: Event::new(false),
        }
    }

    pub fn is_tracer_stop_requested(&self) -> bool {
        self.tracer_stop_requested.load(Ordering::Acquire)
    }

    fn set_tracer_stop_requested(&self, requested: bool) {
        self.tracer_stop_requested.store(requested, Ordering::Release);
    }

    pub fn leader(&self) -> Option<Tid> {
        self.state.lock().leader
    }

    fn set_leader(&self, leader: Option<Tid>) {
        self.state.lock().leader = leader;
    }
}

impl Default for DebugData {
    fn default() -> Self {
        Self::new()
    }
}

/// Attaches `tracer` to `tracee`.
pub fn attach_tracer(tracee: &Arc<Proc>, tracer: &Arc<Proc>) {
    let debug = tracee.ensure_debug_data();
    *debug.tracing_process.lock() = Some(Arc::downgrade(tracer));
}

/// Detaches any tracer. In-flight breaks notice and fall through.
pub fn detach_tracer(tracee: &Arc<Proc>) {
    if let Some(debug) = tracee.debug_data() {
        *debug.tracing_process.lock() = None;
    }
}

pub fn tracing_process(proc: &Arc<Proc>) -> Option<Arc<Proc>> {
    proc.debug_data()?
        .tracing_process
        .lock()
        .as_ref()?
        .upgrade()
}

pub fn has_tracer(proc: &Arc<Proc>) -> bool {
    tracing_process(proc).is_some()
}

/// The signal report waiting for the tracer, if any.
pub fn tracer_signal_information(tracee: &Arc<Proc>) -> Option<SignalParameters> {
    Some(tracee.debug_data()?.state.lock().signal_information)
}

/// The currently latched debug command. `Invalid` while a break is waiting
/// on the tracer.
pub fn debug_command(tracee: &Arc<Proc>) -> Option<DebugCommand> {
    Some(tracee.debug_data()?.state.lock().command)
}

/// The tracer's resume: records the command (and what the tracee should
/// see as the signal), then releases the stopped process.
pub fn tracer_continue(
    tracee: &Arc<Proc>,
    command: DebugCommand,
    signal: Option<Signo>,
    break_range: Option<BreakRange>,
) {
    let debug = match tracee.debug_data() {
        Some(debug) => debug.clone(),
        None => return,
    };
    {
        let mut state = debug.state.lock();
        state.command = command;
        state.previous_command = command;
        if let Some(range) = break_range {
            state.break_range = range;
        }
        state.signal_information.number = signal;
    }
    tracee.stop_event.signal_all();
}

/// Unhandled fatal-looking signals with no tracer attached go to the
/// kernel debugger, if one is listening.
fn forward_user_mode_exception(proc: &Arc<Proc>, params: &mut SignalParameters) {
    let kernel = match proc.kernel() {
        Some(kernel) => kernel,
        None => return,
    };
    if !kernel.kd.is_debugger_connected() || !kernel.kd.are_user_exceptions_enabled() {
        return;
    }
    let number = match params.number {
        Some(number) => number,
        None => return,
    };
    if !number.is_queued() && !KERNEL_REPORTED_USER_SIGNALS.contains(number) {
        return;
    }

    if number != Signo::Trap {
        log::error!(
            "*** User mode process {} ({}) caught signal {} ***",
            proc.id(),
            proc.name(),
            number.name()
        );
    }

    // The exception service round-trip belongs to the debugger transport.
    // A trap is cleared afterwards so the process continues rather than
    // dying on its own breakpoint.
    if number == Signo::Trap {
        params.number = None;
    }
}

/// Presents the candidate signal to the tracer and applies its verdict.
///
/// Returns whether this thread ended up waiting on the stop event, which
/// the stop driver uses to decide if it still owes a stop wait.
pub(crate) async fn tracer_break(
    thread: &Arc<Thread>,
    params: &mut SignalParameters,
    trap_frame: &mut TrapFrame,
    thread_already_stopped: bool,
) -> bool {
    let proc = thread.proc().clone();
    let mut thread_already_stopped = thread_already_stopped;
    let mut stop_handled = false;

    let debug = match proc.debug_data() {
        Some(debug) if debug.tracing_process.lock().is_some() => debug.clone(),
        _ => {
            // Nobody tracing. Unexpected faults still bubble up to the
            // kernel debugger.
            let forward = match params.number {
                Some(Signo::Abort) => true,
                Some(
                    number @ (Signo::IllegalInstruction
                    | Signo::BusError
                    | Signo::MathError
                    | Signo::AccessViolation),
                ) => !proc.queued().lock().await.handled.contains(number),
                _ => false,
            };
            if forward {
                forward_user_mode_exception(&proc, params);
            }
            return stop_handled;
        }
    };

    let reason = if params.number == Some(Signo::Continue) {
        ChildSignalReason::Continued
    } else {
        ChildSignalReason::Trapped
    };

    // Acquire the tracer lock, servicing a collection in progress instead
    // of spinning against it.
    loop {
        if debug.tracer_lock.try_acquire() {
            break;
        }
        if debug.is_tracer_stop_requested() {
            if !thread_already_stopped {
                dequeue::mark_thread_stopped(&proc).await;
            }
            dequeue::wait_on_stop_event(&proc).await;
            thread_already_stopped = false;
            stop_handled = true;
        } else {
            executor::yield_now().await;
        }
    }

    // The tracer may have detached while the lock was contended. Nothing
    // was stopped on its behalf, so just fall through.
    let tracer = match debug.tracing_process.lock().as_ref().and_then(Weak::upgrade) {
        Some(tracer) => tracer,
        None => {
            debug.tracer_lock.release();
            return stop_handled;
        }
    };

    debug_assert!(!debug.is_tracer_stop_requested());
    debug_assert!(debug.leader().is_none());

    // A trap arriving off a step command clears single-step; range steps
    // only break inside the window.
    if params.number == Some(Signo::Trap) {
        let previous = debug.state.lock().previous_command;
        if matches!(previous, DebugCommand::SingleStep | DebugCommand::RangeStep) {
            arch::set_or_clear_single_step(trap_frame, false);
            if previous == DebugCommand::RangeStep {
                let range = debug.state.lock().break_range;
                let ip = arch::instruction_pointer(trap_frame);
                let in_range = ip >= range.start
                    && ip < range.end
                    && !(ip >= range.hole_start && ip < range.hole_end);
                if !in_range {
                    params.number = None;
                    arch::set_or_clear_single_step(trap_frame, true);
                    debug.tracer_lock.release();
                    return stop_handled;
                }
            }
        }
    }

    debug.state.lock().signal_information = *params;

    // Synchronize with a kill racing in: once the queued lock is held and
    // no kill is pending, the command can be invalidated and the stop
    // event taken down; a kill arriving later re-signals it.
    {
        let sig = proc.queued().lock().await;
        if proc.pending.contains(Signo::Kill) {
            drop(sig);
            debug.tracer_lock.release();
            return stop_handled;
        }
        debug.state.lock().command = DebugCommand::Invalid;
        proc.stop_event.unsignal();
    }

    if !thread_already_stopped {
        dequeue::mark_thread_stopped(&proc).await;
    }

    // Halt the rest of the process. The request also redirects threads
    // contending on the tracer lock into the stop wait.
    debug.set_tracer_stop_requested(true);
    let mut stop_sent = false;
    if proc.thread_count.load(Ordering::Acquire) > 1 {
        signal::signal_process(&proc, Signo::Stop, None).await;
        stop_sent = true;
    }

    {
        // Everyone may already be stopped (or exited); complete the
        // collection ourselves then. Serialized with stoppers and exiters
        // by the queued lock.
        let _sig = proc.queued().lock().await;
        if proc.stopped_thread_count.load(Ordering::Acquire)
            == proc.thread_count.load(Ordering::Acquire)
        {
            debug.all_stopped_event.signal_all();
        }
    }

    debug.all_stopped_event.wait().await;
    debug_assert!(debug.is_tracer_stop_requested());

    // Only this thread observes the fully-stopped state.
    debug.all_stopped_event.unsignal();
    debug.set_tracer_stop_requested(false);
    debug.set_leader(Some(thread.id()));

    // Scrub the stop before releasing anyone, or the first thread out
    // would stop right again.
    if params.number == Some(Signo::Stop) || stop_sent {
        let _sig = proc.queued().lock().await;
        if params.number == Some(Signo::Stop) {
            if thread.pending.contains(Signo::Stop) {
                thread.pending.remove(Signo::Stop);
                if stop_sent {
                    proc.pending.remove(Signo::Stop);
                }
            } else {
                proc.pending.remove(Signo::Stop);
            }
        } else {
            debug_assert!(stop_sent);
            proc.pending.remove(Signo::Stop);
        }
    }

    // Report to the tracer: the candidate signal rides in the exit-status
    // slot, the break kind in the reason.
    signal::queue_child_signal(
        &proc,
        &tracer,
        params.number.map_or(0, |n| n.to_primitive() as usize),
        reason,
    )
    .await;

    // Wait out the tracer's continue, then serialize with the stragglers
    // draining the barrier.
    dequeue::wait_on_stop_event(&proc).await;
    stop_handled = true;
    debug.all_stopped_event.wait().await;
    debug.all_stopped_event.unsignal();
    debug.set_leader(None);

    let original = params.number;
    *params = debug.state.lock().signal_information;
    let new = params.number;

    // A kill ended the session; every thread is released to die.
    if proc.pending.contains(Signo::Kill) {
        debug.tracer_lock.release();
        return stop_handled;
    }

    // A verdict that swaps in a different non-maskable signal must become
    // process state for the machine to converge. An unchanged signal is
    // not replayed.
    if new != original {
        if let Some(new @ (Signo::Kill | Signo::Stop | Signo::Continue)) = new {
            signal::signal_process(&proc, new, None).await;
        }
    }

    debug.tracer_lock.release();
    stop_handled
}
