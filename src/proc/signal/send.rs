//! Enqueue paths: placement of a signal into thread or process state, the
//! wake policy, and the process-wide control-signal coordination.

use core::sync::atomic::{fence, Ordering};

use alloc::{sync::Arc, vec::Vec};

use crate::{
    proc::{
        process::{Kernel, Proc, ProcSig},
        signal::{
            queue::{push_entry, Completion, SignalQueueEntry, WhichList},
            tracer, ChildSignalReason, SignalParameters, Signo,
        },
        thread::{SignalPendingState, Thread},
        Pid,
    },
    syscall::Error,
};

/// Places a signal into thread or process state. The caller holds the
/// process queued lock (witnessed by `sig`).
pub(crate) fn queue_signal(
    proc: &Arc<Proc>,
    sig: &mut ProcSig,
    thread: Option<&Arc<Thread>>,
    number: Signo,
    entry: Option<Arc<SignalQueueEntry>>,
    force: bool,
) {
    let mut pending_type = SignalPendingState::None;
    let mut only_wake_suspended = false;

    let signal_ignored;
    let mut signal_blocked = false;
    if force {
        let thread = thread.expect("forced signals target a thread");
        let thread_sig = unsafe { thread.sig.assume_locked() };
        thread_sig.blocked.remove(number);
        signal_ignored = false;

        // A forced signal that is already running on the thread escalates
        // to a process-wide kill rather than recursing into its handler.
        if thread_sig.running.contains(number) {
            proc.set_exit_status(ChildSignalReason::Killed, number.to_primitive() as usize);
            let deferred = queue_signal_to_process(proc, sig, Signo::Kill, None);
            debug_assert!(deferred.is_none());
            return;
        }
    } else {
        signal_ignored = sig.ignored.contains(number);
        if let Some(thread) = thread {
            signal_blocked = unsafe { thread.sig.assume_locked() }
                .blocked
                .contains(number);
        }
    }

    if let Some(entry) = entry {
        let mut ignored = signal_ignored;
        {
            let mut state = entry.state();
            debug_assert_eq!(state.params.number, Some(number));
            debug_assert!(!state.delivered || number == Signo::ChildProcessActivity);
            state.destination_thread = thread.map(|t| t.id());
            // A redelivered entry counts as ignored, deduplicating it.
            if state.delivered {
                ignored = true;
            }
        }

        let has_tracer = tracer::has_tracer(proc);
        let handled = sig.handled.contains(number);
        if (ignored || (!handled && number.is_default_ignore())) && !has_tracer {
            if number == Signo::ChildProcessActivity {
                // Parked rather than dropped, so wait still sees it. Only
                // suspended consumers care.
                push_entry(&mut sig.blocked_queue, WhichList::BlockedList, &entry);
                pending_type = SignalPendingState::ChildOnly;
                only_wake_suspended = true;
            } else {
                entry.complete();
            }
        } else if signal_blocked {
            if number == Signo::ChildProcessActivity {
                pending_type = SignalPendingState::ChildOnly;
                only_wake_suspended = true;
            }
            push_entry(&mut sig.blocked_queue, WhichList::BlockedList, &entry);
        } else {
            match thread {
                Some(thread) => {
                    push_entry(
                        &mut unsafe { thread.sig.assume_locked() }.queue,
                        WhichList::ThreadQueue(thread.id()),
                        &entry,
                    );
                    thread.sync_queue_hint();
                }
                None => {
                    push_entry(&mut sig.queue, WhichList::ProcessQueue, &entry);
                    proc.sync_queue_hint(sig);
                }
            }
            pending_type = SignalPendingState::Any;
        }
    } else if !signal_ignored {
        match thread {
            Some(thread) => thread.pending.add(number),
            None => proc.pending.add(number),
        }
        if !signal_blocked {
            pending_type = SignalPendingState::Any;
        }
    }

    if pending_type == SignalPendingState::None {
        return;
    }

    match thread {
        Some(thread) => {
            thread.raise_signal_pending(pending_type);
            // Publish the signal and the raised state before the wake; the
            // consumer's fence in dequeue pairs with this one.
            fence(Ordering::SeqCst);
            thread.wake(only_wake_suspended);
        }
        None => {
            for thread in sig.threads.values() {
                let thread_blocks = unsafe { thread.sig.assume_locked() }
                    .blocked
                    .contains(number);
                // Threads blocking the signal are skipped, except for child
                // activity, which still wakes suspended waiters.
                if thread_blocks && number != Signo::ChildProcessActivity {
                    continue;
                }
                let mut wake_type = pending_type;
                let mut wake_only_suspended = only_wake_suspended;
                if number == Signo::ChildProcessActivity && thread_blocks {
                    wake_type = SignalPendingState::ChildOnly;
                    wake_only_suspended = true;
                }
                thread.raise_signal_pending(wake_type);
                fence(Ordering::SeqCst);
                thread.wake(wake_only_suspended);
            }
        }
    }
}

/// Process-scoped placement, adding the stop/continue/kill event
/// coordination. Returns an entry whose completion the caller must run
/// after dropping the queued lock.
pub(crate) fn queue_signal_to_process(
    proc: &Arc<Proc>,
    sig: &mut ProcSig,
    number: Signo,
    entry: Option<Arc<SignalQueueEntry>>,
) -> Option<Arc<SignalQueueEntry>> {
    // With no threads left there is no one to deliver to; finish the entry
    // now. Child signals complete outside the lock.
    if proc.thread_count.load(Ordering::Acquire) == 0 {
        if let Some(entry) = entry {
            if number == Signo::ChildProcessActivity {
                return Some(entry);
            }
            entry.complete();
        }
        return None;
    }

    match number {
        Signo::Stop => {
            // A killed process may not be re-stopped.
            if !proc.pending.contains(Signo::Kill) {
                proc.pending.remove(Signo::Continue);
                proc.stop_event.unsignal();
            }
        }
        Signo::Continue => {
            proc.pending.remove(Signo::Stop);
            proc.stop_event.signal_all();
        }
        Signo::Kill => {
            proc.pending.remove(Signo::Stop);
            proc.pending.remove(Signo::Continue);
            proc.stop_event.signal_all();
        }
        _ => {}
    }

    if let Some(entry) = &entry {
        entry.state().delivered = false;
    }
    queue_signal(proc, sig, None, number, entry, false);
    None
}

/// Sends a signal to a thread. Control signals really target the whole
/// process. `force` strips the block and escalates recursion to a kill.
pub async fn signal_thread(
    thread: &Arc<Thread>,
    number: Signo,
    entry: Option<Arc<SignalQueueEntry>>,
    force: bool,
) {
    if matches!(number, Signo::Stop | Signo::Kill | Signo::Continue) {
        if number == Signo::Kill {
            thread
                .proc()
                .set_exit_status(ChildSignalReason::Killed, Signo::Kill.to_primitive() as usize);
        }
        signal_process(thread.proc(), number, entry).await;
        return;
    }

    if let Some(entry) = &entry {
        entry.state().delivered = false;
    }
    let proc = thread.proc().clone();
    let mut sig = proc.queued().lock().await;
    queue_signal(&proc, &mut sig, Some(thread), number, entry, force);
}

/// Sends a signal to a process.
pub async fn signal_process(proc: &Arc<Proc>, number: Signo, entry: Option<Arc<SignalQueueEntry>>) {
    debug_assert!(!proc.is_kernel());

    if number == Signo::Kill {
        proc.set_exit_status(ChildSignalReason::Killed, Signo::Kill.to_primitive() as usize);
    }

    let mut sig = proc.queued().lock().await;
    let deferred = queue_signal_to_process(proc, &mut sig, number, entry);
    drop(sig);
    if let Some(entry) = deferred {
        entry.complete();
    }
}

/// Sends a signal to a process, building the queue entry for queued-range
/// numbers.
pub async fn signal_process_with_params(
    proc: &Arc<Proc>,
    number: Signo,
    code: i16,
    parameter: usize,
    sender: Option<&Arc<Thread>>,
) {
    if !number.is_queued() {
        signal_process(proc, number, None).await;
        return;
    }

    let params = SignalParameters {
        number: Some(number),
        code,
        sending_process: sender.map_or(0, |t| t.proc().id()),
        sending_user: sender.map_or(0, |t| t.identity.real_user),
        parameter,
    };
    let entry = SignalQueueEntry::new(params, Completion::Release);
    signal_process(proc, number, Some(entry)).await;
}

/// Replays every parked entry through the queue logic after a mask change,
/// so per-thread pending state is recomputed rather than guessed. The
/// current thread's pending state drops to unknown, forcing a full pass.
pub(crate) fn requeue_blocked_signals(proc: &Arc<Proc>, sig: &mut ProcSig, current: &Arc<Thread>) {
    if !sig.blocked_queue.is_empty() {
        let parked: Vec<Arc<SignalQueueEntry>> = sig.blocked_queue.drain(..).collect();
        for entry in parked {
            let (number, destination) = {
                let mut state = entry.state();
                state.linked = None;
                (state.params.number, state.destination_thread)
            };
            let number = match number {
                Some(number) => number,
                None => {
                    entry.complete();
                    continue;
                }
            };
            let destination = destination.and_then(|tid| sig.threads.get(&tid).cloned());
            queue_signal(proc, sig, destination.as_ref(), number, Some(entry), false);
        }
    }

    current.set_signal_pending_state(SignalPendingState::Unknown);
}

/// True when the thread neither blocks nor ignores the signal.
pub async fn is_thread_accepting_signal(thread: &Arc<Thread>, number: Signo) -> bool {
    let proc = thread.proc();
    let sig = proc.queued().lock().await;
    let blocked = unsafe { thread.sig.assume_locked() }
        .blocked
        .contains(number);
    !(blocked || sig.ignored.contains(number))
}

/// Whether the sender may signal the target. Continue is additionally
/// permitted within the session; the kill capability overrides.
pub fn check_send_signal_permission(
    current: &Arc<Thread>,
    target: &Arc<Proc>,
    number: Option<Signo>,
) -> Result<(), Error> {
    // A fully exited process no longer has an identity to check against.
    if target.thread_count.load(Ordering::Acquire) == 0 && target.exit_status().reason.is_some() {
        return Err(Error::NoSuchProcess);
    }

    let sender = &current.identity;
    let target_identity = target.identity();
    if sender.effective_user == target_identity.real_user
        || sender.real_user == target_identity.real_user
        || sender.effective_user == target_identity.saved_user
        || sender.real_user == target_identity.saved_user
    {
        return Ok(());
    }

    if number == Some(Signo::Continue)
        && current.proc().identifiers().session_id == target.identifiers().session_id
    {
        return Ok(());
    }

    if sender.capabilities.contains(crate::proc::Capabilities::KILL) {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMatch {
    /// Match a specific process id; -1 matches every process.
    Process,
    /// Match every member of a process group.
    ProcessGroup,
}

/// Sends to every matching process. Permission failures are sticky-last but
/// do not stop the iteration; the count of reached targets is returned on
/// success. A number of `None` is the existence probe: permission checks
/// run, nothing is queued.
pub async fn send_signal_to_matching(
    kernel: &Arc<Kernel>,
    current: Option<&Arc<Thread>>,
    match_type: ProcMatch,
    id: Pid,
    skip: Option<&Arc<Proc>>,
    check_permissions: bool,
    number: Option<Signo>,
    template: Option<SignalParameters>,
) -> Result<u32, Error> {
    let mut sent: u32 = 0;
    let mut status: Result<(), Error> = Ok(());

    for proc in kernel.processes() {
        if proc.is_kernel() {
            continue;
        }
        if let Some(skip) = skip {
            if Arc::ptr_eq(&proc, skip) {
                continue;
            }
        }
        let matched = match match_type {
            ProcMatch::Process => id == -1 || proc.id() == id,
            ProcMatch::ProcessGroup => proc.identifiers().process_group_id == id,
        };
        if !matched {
            continue;
        }

        if check_permissions {
            let current = current.expect("permission checks need a sending thread");
            if let Err(error) = check_send_signal_permission(current, &proc, number) {
                status = Err(error);
                continue;
            }
        }

        if let Some(number) = number {
            // Each recipient gets its own copy of the payload.
            let entry = template.map(|params| {
                SignalQueueEntry::new(
                    SignalParameters {
                        number: Some(number),
                        ..params
                    },
                    Completion::Release,
                )
            });
            signal_process(&proc, number, entry).await;
        }
        sent += 1;
    }

    status.map(|_| sent)
}

/// Signals every process in the system except the kernel process. Kernel
/// origin skips the permission checks and does not skip the caller.
pub async fn signal_all_processes(
    kernel: &Arc<Kernel>,
    current: Option<&Arc<Thread>>,
    number: Signo,
    template: Option<SignalParameters>,
) -> Result<u32, Error> {
    let skip = current.map(|thread| thread.proc().clone());
    send_signal_to_matching(
        kernel,
        current,
        ProcMatch::Process,
        -1,
        skip.as_ref(),
        current.is_some(),
        Some(number),
        template,
    )
    .await
}
