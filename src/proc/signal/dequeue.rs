//! The consumer side: at every return to user mode a thread pulls at most
//! one deliverable signal, draining non-maskable work first.

use core::sync::atomic::{fence, Ordering};

use alloc::sync::Arc;

use crate::{
    arch::{self, TrapFrame},
    proc::{
        process::Proc,
        signal::{
            self,
            queue::{push_entry, SignalQueueEntry, WhichList},
            tracer, ChildSignalReason, SignalParameters, SignalSet, Signo,
            DEFAULT_ABORT_SIGNALS, DEFAULT_STOP_SIGNALS, DEFAULT_TERMINATE_SIGNALS,
        },
        thread::{SignalPendingState, Thread},
    },
};

/// Outcome of a dequeue pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeuedSignal {
    /// Nothing deliverable is pending.
    None,
    /// One signal selected for delivery.
    Signal(SignalParameters),
    /// A kill was pending; the thread must tear itself down and never
    /// return to user mode.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    None,
    Delivered(Signo),
    Terminated,
}

/// Marks the calling thread stopped. Returns true for the 0 -> 1
/// transition, whose thread drives parent and tracer notification.
pub(crate) async fn mark_thread_stopped(proc: &Arc<Proc>) -> bool {
    // When traced, the count and the all-stopped event must move together
    // with respect to exiting threads, which is what the queued lock
    // serializes here.
    let debug = proc.debug_data().cloned();
    let guard = match debug {
        Some(_) => Some(proc.queued().lock().await),
        None => None,
    };

    let stopped = proc.stopped_thread_count.fetch_add(1, Ordering::AcqRel) + 1;
    if let Some(debug) = proc.debug_data() {
        if debug.is_tracer_stop_requested()
            && stopped == proc.thread_count.load(Ordering::Acquire)
        {
            debug.all_stopped_event.signal_all();
        }
    }
    drop(guard);
    stopped == 1
}

/// Parks the calling thread in the stop wait. On release it leaves the
/// barrier; the last thread out completes a waiting debug leader.
pub(crate) async fn wait_on_stop_event(proc: &Arc<Proc>) {
    proc.stop_event.wait().await;
    let previous = proc.stopped_thread_count.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 {
        if let Some(debug) = proc.debug_data() {
            if debug.leader().is_some() {
                debug.all_stopped_event.signal_all();
            }
        }
    }
}

fn tracer_is_parent(proc: &Arc<Proc>) -> bool {
    match tracer::tracing_process(proc) {
        Some(tracing) => match proc.parent() {
            Some(parent) => Arc::ptr_eq(&tracing, &parent),
            None => false,
        },
        None => false,
    }
}

/// Drains kill and stop before anything maskable is considered. Returns a
/// signal only when the tracer substituted one for the stop.
pub async fn check_for_non_maskable_signals(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
) -> DequeuedSignal {
    let proc = thread.proc().clone();
    loop {
        let combined = thread.pending.load().union(proc.pending.load());

        if combined.contains(Signo::Kill) {
            return DequeuedSignal::Terminated;
        }

        if combined.contains(Signo::Stop) {
            let first = mark_thread_stopped(&proc).await;
            let mut stop_handled = false;
            if first {
                let mut params = SignalParameters::new(Signo::Stop);
                stop_handled = tracer::tracer_break(thread, &mut params, trap_frame, true).await;
                if params.number != Some(Signo::Stop) {
                    // The tracer turned the stop into a real signal (or
                    // nothing at all).
                    match params.number {
                        Some(_) => return DequeuedSignal::Signal(params),
                        None => continue,
                    }
                }

                // Still a stop; let the parent know, unless it is already
                // watching as the tracer.
                if !tracer_is_parent(&proc) {
                    signal::queue_child_signal_to_parent(
                        &proc,
                        Signo::Stop.to_primitive() as usize,
                        ChildSignalReason::Stopped,
                    )
                    .await;
                }
            }

            if !first || !stop_handled {
                wait_on_stop_event(&proc).await;
            }
            continue;
        }

        break;
    }

    DequeuedSignal::None
}

enum EntryAction {
    Deliver,
    /// Headed for discard, but a tracer is attached and sees everything.
    IgnoredTraced,
}

/// Selects at most one signal for delivery: non-maskable work first, then
/// the lowest unmasked standard signal, then queued entries (process queue
/// before thread queue, FIFO within each).
pub async fn dequeue_pending_signal(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
) -> DequeuedSignal {
    let proc = thread.proc().clone();

    if thread.signal_pending_state() == SignalPendingState::None {
        return DequeuedSignal::None;
    }

    match check_for_non_maskable_signals(thread, trap_frame).await {
        DequeuedSignal::None => {}
        other => return other,
    }

    // Everything pending is about to be looked at; fresh enqueues will
    // raise the state again. The fence pairs with the producer fence in
    // the send path: after it, this thread's set/queue reads see anything
    // published before a wake.
    thread.set_signal_pending_state(SignalPendingState::None);
    fence(Ordering::SeqCst);

    // Preliminary check without the lock. It cannot prove a signal is
    // present, but it can prove absence.
    if thread.pending.load().union(proc.pending.load()).is_empty()
        && !proc.queue_nonempty.load(Ordering::Acquire)
        && !thread.queue_nonempty.load(Ordering::Acquire)
    {
        return DequeuedSignal::None;
    }

    let mut guard = Some(proc.queued().lock().await);

    let thread_mask = thread.pending.load();
    let proc_mask = proc.pending.load();
    let mut combined = thread_mask.union(proc_mask);
    {
        let thread_sig = unsafe { thread.sig.assume_locked() };
        combined = combined
            .difference(thread_sig.blocked)
            .difference(thread_sig.running);
    }

    // The saved view keeps stop and kill: they may have landed after the
    // non-maskable check, and the pending state restored below must not
    // lose them. Bits are dropped from it as they are consumed.
    let mut saved_mask = combined;
    combined.remove(Signo::Stop);
    combined.remove(Signo::Kill);

    // Standard signals, lowest number first.
    let mut remaining = combined;
    while let Some(number) = remaining.lowest() {
        remaining.remove(number);

        if thread_mask.contains(number) {
            thread.pending.remove(number);
        } else if proc_mask.contains(number) {
            proc.pending.remove(number);
        }

        restore_pending_hint(thread, &proc, &mut saved_mask, Some(number), guard.as_deref());

        drop(guard.take());
        let mut params = SignalParameters::new(number);
        tracer::tracer_break(thread, &mut params, trap_frame, false).await;
        match params.number {
            Some(delivered) => {
                // A continue passing through untouched is also news for the
                // parent.
                if number == Signo::Continue
                    && delivered == Signo::Continue
                    && !tracer_is_parent(&proc)
                {
                    signal::queue_child_signal_to_parent(
                        &proc,
                        Signo::Continue.to_primitive() as usize,
                        ChildSignalReason::Continued,
                    )
                    .await;
                }
                return DequeuedSignal::Signal(params);
            }
            // Suppressed; look at the next bit.
            None => guard = Some(proc.queued().lock().await),
        }
    }

    // No standard signal survived; walk the queues.
    loop {
        let mut action: Option<(Arc<SignalQueueEntry>, EntryAction)> = None;
        {
            let sig = &mut **guard.as_mut().expect("queued lock held");
            let thread_sig = unsafe { thread.sig.assume_locked() };
            let handled_set = sig.handled;
            let blocked_set = thread_sig.blocked;
            let blocked_queue = &mut sig.blocked_queue;
            let proc_queue = &mut sig.queue;

            'scan: for pass in 0..2 {
                let list = if pass == 0 {
                    &mut *proc_queue
                } else {
                    &mut thread_sig.queue
                };

                let mut index = 0;
                while index < list.len() {
                    let entry = list[index].clone();
                    let (number, delivered) = {
                        let state = entry.state();
                        (state.params.number, state.delivered)
                    };
                    let number = match number {
                        Some(number) => number,
                        None => {
                            debug_assert!(false, "queued entry without a signal number");
                            list.remove(index);
                            entry.state().linked = None;
                            entry.complete();
                            continue;
                        }
                    };

                    // One way or another this entry is not staying here.
                    if !handled_set.contains(number) && number.is_default_ignore() {
                        list.remove(index);
                        entry.state().linked = None;
                        if tracer::has_tracer(&proc) {
                            action = Some((entry, EntryAction::IgnoredTraced));
                            break 'scan;
                        }
                        if number == Signo::ChildProcessActivity {
                            // Parked so wait can pick it up.
                            push_entry(blocked_queue, WhichList::BlockedList, &entry);
                        } else {
                            entry.complete();
                        }
                        continue;
                    }

                    if blocked_set.contains(number) {
                        list.remove(index);
                        entry.state().linked = None;
                        push_entry(blocked_queue, WhichList::BlockedList, &entry);
                        continue;
                    }

                    if delivered {
                        list.remove(index);
                        entry.state().linked = None;
                        continue;
                    }

                    list.remove(index);
                    entry.state().linked = None;
                    action = Some((entry, EntryAction::Deliver));
                    break 'scan;
                }
            }

            restore_pending_hint(thread, &proc, &mut saved_mask, None, Some(sig));
            proc.sync_queue_hint(sig);
            thread.sync_queue_hint();
        }
        drop(guard.take());

        let (entry, action) = match action {
            Some(found) => found,
            None => return DequeuedSignal::None,
        };

        match action {
            EntryAction::IgnoredTraced => {
                // The debugger gets a look at a copy; the verdict cannot
                // alter an entry that is headed for discard.
                let mut params = entry.params();
                tracer::tracer_break(thread, &mut params, trap_frame, false).await;
                if entry.params().number == Some(Signo::ChildProcessActivity) {
                    let mut sig = proc.queued().lock().await;
                    push_entry(&mut sig.blocked_queue, WhichList::BlockedList, &entry);
                    drop(sig);
                } else {
                    entry.complete();
                }
                guard = Some(proc.queued().lock().await);
            }
            EntryAction::Deliver => {
                let mut params = entry.params();
                tracer::tracer_break(thread, &mut params, trap_frame, false).await;
                match params.number {
                    Some(_) => {
                        entry.state().delivered = true;
                        if entry.params().number == Some(Signo::ChildProcessActivity) {
                            // Delivered, but wait must still be able to
                            // observe it.
                            let mut sig = proc.queued().lock().await;
                            push_entry(&mut sig.blocked_queue, WhichList::BlockedList, &entry);
                            drop(sig);
                        } else {
                            entry.complete();
                        }
                        return DequeuedSignal::Signal(params);
                    }
                    None => {
                        // The tracer swallowed it; free the entry and look
                        // for another.
                        entry.complete();
                        guard = Some(proc.queued().lock().await);
                    }
                }
            }
        }
    }
}

/// Repairs the thread's pending state before the queued lock is dropped:
/// clearing it above was a guess, and remaining work (including stop/kill
/// bits that landed meanwhile) must not be slept through.
fn restore_pending_hint(
    thread: &Arc<Thread>,
    proc: &Arc<Proc>,
    saved_mask: &mut SignalSet,
    consumed: Option<Signo>,
    sig: Option<&crate::proc::process::ProcSig>,
) {
    if let Some(number) = consumed {
        saved_mask.remove(number);
    }
    if thread.signal_pending_state() != SignalPendingState::None {
        return;
    }
    let sig = match sig {
        Some(sig) => sig,
        None => return,
    };
    let thread_queue_empty = unsafe { thread.sig.assume_locked() }.queue.is_empty();
    if !saved_mask.is_empty() || !sig.queue.is_empty() || !thread_queue_empty {
        // Real deliverable work remains; the child-only distinction exists
        // just to keep idle waiters asleep, and this thread is awake.
        thread.set_signal_pending_state(SignalPendingState::Any);
    }
}

/// Dequeues and synchronously applies at most one signal.
pub async fn dispatch_pending_signals(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
) -> DispatchResult {
    match dequeue_pending_signal(thread, trap_frame).await {
        DequeuedSignal::None => DispatchResult::None,
        DequeuedSignal::Terminated => DispatchResult::Terminated,
        DequeuedSignal::Signal(params) => {
            let number = match params.number {
                Some(number) => number,
                None => return DispatchResult::None,
            };
            arch::apply_synchronous_signal(thread, trap_frame, &params).await;
            DispatchResult::Delivered(number)
        }
    }
}

/// Applies the default action when no handler takes the signal. Returns
/// true when the signal was consumed in kernel mode.
pub async fn attempt_default_processing(thread: &Arc<Thread>, number: Signo) -> bool {
    let proc = thread.proc().clone();

    // Stop and kill were acted on by the non-maskable path; if one shows
    // up here a debugger substituted it and it is already process state.
    if matches!(number, Signo::Kill | Signo::Stop) {
        return true;
    }

    let send;
    {
        let sig = proc.queued().lock().await;
        if sig.handled.contains(number) && sig.handler.is_some() {
            return false;
        }

        // Continue can be handled, but its work (releasing the stop) was
        // done at queue time; bare delivery ends here.
        if number == Signo::Continue {
            return true;
        }

        if number.is_default_ignore() {
            return true;
        }

        if DEFAULT_ABORT_SIGNALS.contains(number) {
            proc.set_exit_status(ChildSignalReason::Dumped, number.to_primitive() as usize);
            send = Signo::Kill;
        } else if DEFAULT_TERMINATE_SIGNALS.contains(number) || number.is_queued() {
            proc.set_exit_status(ChildSignalReason::Killed, number.to_primitive() as usize);
            send = Signo::Kill;
        } else if DEFAULT_STOP_SIGNALS.contains(number) {
            proc.set_exit_status(ChildSignalReason::Stopped, number.to_primitive() as usize);
            send = Signo::Stop;
        } else if sig.handler.is_none() {
            proc.set_exit_status(ChildSignalReason::Dumped, number.to_primitive() as usize);
            send = Signo::Kill;
        } else {
            return false;
        }
    }

    log::debug!(
        "process {} ({}) takes default action for signal {}",
        proc.id(),
        proc.name(),
        number.name()
    );
    signal::signal_process(&proc, send, None).await;
    true
}
