use alloc::sync::Arc;

use futures_util::{
    future::{select, Either},
    pin_mut,
};

use crate::{
    arch::{self, TrapFrame},
    proc::{
        process::{get_thread_by_id, Kernel},
        signal::{
            self, Completion, DispatchResult, ProcMatch, SignalParameters, SignalQueueEntry,
            SignalSet, Signo, SIGNAL_CODE_USER, SIGNAL_COUNT,
        },
        Pid, Thread, Tid,
    },
    time::Clock,
};

use super::{
    ChildEvent, Error, SendSignal, SignalMaskOperation, SignalMaskType, SignalTarget, SysError,
    SysResult, WaitFlags,
};

/// Swaps the process-wide handler trampoline, returning the previous one.
pub async fn sys_set_signal_handler(thread: &Arc<Thread>, handler: Option<usize>) -> Option<usize> {
    let proc = thread.proc().clone();
    let mut sig = proc.queued().lock().await;
    let previous = sig.handler;
    sig.handler = handler;
    previous
}

/// Returns from a signal handler: restores the pre-signal trap frame and
/// replays parked signals against the (possibly changed) masks.
pub async fn sys_restore_context(thread: &Arc<Thread>, trap_frame: &mut TrapFrame) {
    let restored = arch::restore_pre_signal_trap_frame(thread, trap_frame);
    let proc = thread.proc().clone();
    let mut sig = proc.queued().lock().await;
    if let Some(number) = restored {
        unsafe { thread.sig.assume_locked() }.running.remove(number);
    }
    signal::requeue_blocked_signals(&proc, &mut sig, thread);
}

/// Overwrites the blocked mask, returning the previous one. Stop, kill and
/// continue are never blockable.
pub async fn set_signal_mask(thread: &Arc<Thread>, new_mask: SignalSet) -> SignalSet {
    let mut mask = new_mask;
    mask.remove(Signo::Stop);
    mask.remove(Signo::Kill);
    mask.remove(Signo::Continue);

    let proc = thread.proc().clone();
    let mut sig = proc.queued().lock().await;
    let thread_sig = unsafe { thread.sig.assume_locked() };
    let original = thread_sig.blocked;
    thread_sig.blocked = mask;
    signal::requeue_blocked_signals(&proc, &mut sig, thread);
    original
}

/// Manipulates one of the behavior masks, returning its previous value.
/// Reading the pending mask ignores the operation.
pub async fn sys_set_signal_behavior(
    thread: &Arc<Thread>,
    mask_type: SignalMaskType,
    operation: SignalMaskOperation,
    set: SignalSet,
) -> SignalSet {
    let mut new_mask = set;
    new_mask.remove(Signo::Stop);
    new_mask.remove(Signo::Kill);

    let proc = thread.proc().clone();
    let mut sig = proc.queued().lock().await;

    fn apply(
        operation: SignalMaskOperation,
        target: SignalSet,
        mask: SignalSet,
    ) -> (SignalSet, bool) {
        match operation {
            SignalMaskOperation::Overwrite => (mask, true),
            SignalMaskOperation::Set => (target.union(mask), true),
            SignalMaskOperation::Clear => (target.difference(mask), true),
            SignalMaskOperation::None => (target, false),
        }
    }

    let (original, changed) = match mask_type {
        SignalMaskType::Pending => {
            // The pending view: both bitmaps plus parked entries aimed at
            // no thread in particular or at this one.
            let mut result = thread.pending.load().union(proc.pending.load());
            for entry in sig.blocked_queue.iter() {
                let state = entry.state();
                if state.destination_thread.is_none()
                    || state.destination_thread == Some(thread.id())
                {
                    if let Some(number) = state.params.number {
                        result.add(number);
                    }
                }
            }
            return result;
        }
        SignalMaskType::Blocked => {
            new_mask.remove(Signo::Continue);
            let thread_sig = unsafe { thread.sig.assume_locked() };
            let original = thread_sig.blocked;
            let (updated, changed) = apply(operation, original, new_mask);
            thread_sig.blocked = updated;
            (original, changed)
        }
        SignalMaskType::Ignored => {
            let original = sig.ignored;
            let (updated, changed) = apply(operation, original, new_mask);
            sig.ignored = updated;
            (original, changed)
        }
        SignalMaskType::Handled => {
            // Touching the handled mask always clears those bits from
            // ignored, saving the caller a second call.
            sig.ignored = sig.ignored.difference(new_mask);
            let original = sig.handled;
            let (updated, changed) = apply(operation, original, new_mask);
            sig.handled = updated;
            (original, changed)
        }
    };

    if changed {
        signal::requeue_blocked_signals(&proc, &mut sig, thread);
    }
    original
}

/// Sends a signal from user space to one of the target classes. Signal 0
/// checks existence and permission without queuing anything.
pub async fn sys_send_signal(
    kernel: &Arc<Kernel>,
    thread: &Arc<Thread>,
    request: &SendSignal,
) -> Result<(), Error> {
    let current_proc = thread.proc().clone();

    if request.signal_number >= SIGNAL_COUNT {
        return Err(Error::InvalidParameter);
    }
    let number = if request.signal_number == 0 {
        None
    } else {
        match Signo::from_primitive(request.signal_number) {
            Some(number) => Some(number),
            None => return Err(Error::InvalidParameter),
        }
    };

    // Only the kernel generates positive codes.
    let code = if request.signal_code > 0 {
        SIGNAL_CODE_USER
    } else {
        request.signal_code
    };

    match request.target_type {
        SignalTarget::Thread => {
            let target = if request.target_id == 0 {
                thread.clone()
            } else {
                get_thread_by_id(&current_proc, request.target_id as Tid)
                    .await
                    .ok_or(Error::NoSuchThread)?
            };
            signal::check_send_signal_permission(thread, &current_proc, number)?;

            if let Some(number) = number {
                if !number.is_queued() {
                    signal::signal_thread(&target, number, None, false).await;
                } else {
                    let entry = SignalQueueEntry::new(
                        SignalParameters {
                            number: Some(number),
                            code,
                            sending_process: current_proc.id(),
                            sending_user: thread.identity.real_user,
                            parameter: request.signal_parameter,
                        },
                        Completion::Release,
                    );
                    signal::signal_thread(&target, number, Some(entry), false).await;
                }
            }
            Ok(())
        }

        SignalTarget::CurrentProcessGroup
        | SignalTarget::ProcessGroup
        | SignalTarget::AllProcesses => {
            let (match_type, id, skip) = match request.target_type {
                SignalTarget::CurrentProcessGroup => (
                    ProcMatch::ProcessGroup,
                    current_proc.identifiers().process_group_id,
                    None,
                ),
                SignalTarget::ProcessGroup => (ProcMatch::ProcessGroup, request.target_id, None),
                _ => (ProcMatch::Process, -1, Some(&current_proc)),
            };

            let template = match number {
                Some(number) if number.is_queued() => Some(SignalParameters {
                    number: Some(number),
                    code,
                    sending_process: current_proc.id(),
                    sending_user: thread.identity.real_user,
                    parameter: request.signal_parameter,
                }),
                _ => None,
            };

            let sent = signal::send_signal_to_matching(
                kernel,
                Some(thread),
                match_type,
                id,
                skip,
                true,
                number,
                template,
            )
            .await?;
            if sent == 0 {
                return Err(Error::NoSuchProcess);
            }
            Ok(())
        }

        SignalTarget::CurrentProcess | SignalTarget::Process => {
            let target = if request.target_type == SignalTarget::CurrentProcess
                || request.target_id == current_proc.id()
                || request.target_id == 0
            {
                current_proc.clone()
            } else {
                let target = kernel
                    .get_process_by_id(request.target_id)
                    .ok_or(Error::NoSuchProcess)?;
                if target.is_kernel() {
                    return Err(Error::AccessDenied);
                }
                target
            };

            signal::check_send_signal_permission(thread, &target, number)?;
            if let Some(number) = number {
                signal::signal_process_with_params(
                    &target,
                    number,
                    code,
                    request.signal_parameter,
                    Some(thread),
                )
                .await;
            }
            Ok(())
        }
    }
}

/// Suspends the caller until a matching child reports activity.
pub async fn sys_wait_for_child(
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
    child_pid: Pid,
    flags: WaitFlags,
) -> SysResult<ChildEvent> {
    if (flags & WaitFlags::CHILD_MASK).is_empty() {
        return Err(Error::InvalidParameter.into());
    }

    let proc = thread.proc().clone();
    loop {
        // No eligible children means no point waiting.
        signal::validate_wait_parameters(&proc, child_pid)
            .await
            .map_err(SysError::from)?;

        // Dispatch first: pulling signals later would clobber the
        // child-pending state down to none and sleep forever.
        let dispatched = signal::dispatch_pending_signals(thread, trap_frame).await;
        if dispatched == DispatchResult::Terminated {
            return Err(SysError::Terminated);
        }

        if let Some(entry) = signal::get_child_signal_entry(&proc, child_pid, flags).await {
            let params = entry.params();
            debug_assert_eq!(params.number, Some(Signo::ChildProcessActivity));
            let reason = match signal::ChildSignalReason::from_primitive(params.code as u16) {
                Some(reason) => reason,
                None => {
                    debug_assert!(false, "child signal without a reason");
                    return Err(Error::InvalidParameter.into());
                }
            };
            let resource_usage = entry
                .owner()
                .map(|child| *child.resource_usage.lock())
                .unwrap_or_default();
            let event = ChildEvent {
                pid: params.sending_process,
                reason,
                exit_value: params.parameter,
                resource_usage,
            };
            // Discarded entries (detached by the pull) complete here.
            if !entry.is_linked() {
                entry.complete();
            }
            return Ok(event);
        }

        if flags.contains(WaitFlags::RETURN_IMMEDIATELY) {
            return Err(Error::NoDataAvailable.into());
        }

        // Checked only after the no-hang escape: no-hang callers must
        // never observe an interruption.
        if let DispatchResult::Delivered(_) = dispatched {
            return Err(Error::Interrupted.into());
        }

        thread.suspend().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendTimeout {
    Indefinite,
    Milliseconds(u64),
}

/// Temporarily adjusts the blocked mask, waits for a signal (or timeout),
/// applies it synchronously, and restores the mask.
///
/// In `Clear` mode a signal belonging to the supplied set interrupts the
/// wait without being applied here; it is re-posted for a later dispatch.
pub async fn sys_suspend_execution(
    kernel: &Arc<Kernel>,
    thread: &Arc<Thread>,
    trap_frame: &mut TrapFrame,
    operation: SignalMaskOperation,
    set: SignalSet,
    timeout: SuspendTimeout,
    parameters_out: &mut Option<SignalParameters>,
) -> SysResult<()> {
    let proc = thread.proc().clone();

    let mut set = set;
    set.remove(Signo::Stop);
    set.remove(Signo::Continue);
    set.remove(Signo::Kill);

    // Mask updates synchronize with enqueues through the queued lock, and
    // parked signals are replayed while it is held.
    let mut restore_mask = None;
    if operation != SignalMaskOperation::None {
        let mut sig = proc.queued().lock().await;
        let thread_sig = unsafe { thread.sig.assume_locked() };
        let original = thread_sig.blocked;
        thread_sig.blocked = match operation {
            SignalMaskOperation::Overwrite => set,
            SignalMaskOperation::Clear => original.difference(set),
            SignalMaskOperation::Set => original.union(set),
            SignalMaskOperation::None => original,
        };
        if thread_sig.blocked != original {
            signal::requeue_blocked_signals(&proc, &mut sig, thread);
            restore_mask = Some(original);
        }
    }

    // The deadline is fixed once; interruptions resume the same countdown
    // rather than restarting it.
    let deadline = match timeout {
        SuspendTimeout::Indefinite => None,
        SuspendTimeout::Milliseconds(ms) => {
            Some(kernel.clock.time_counter() + ms * Clock::ticks_per_millisecond())
        }
    };

    let mut caught = None;
    let mut status: SysResult<()> = Ok(());
    loop {
        match signal::dequeue_pending_signal(thread, trap_frame).await {
            signal::DequeuedSignal::Terminated => {
                // The thread is being torn down; the original mask no
                // longer matters.
                return Err(SysError::Terminated);
            }
            signal::DequeuedSignal::Signal(params) => {
                caught = Some(params);
                break;
            }
            signal::DequeuedSignal::None => {}
        }

        match deadline {
            None => thread.suspend().await,
            Some(deadline) => {
                if kernel.clock.time_counter() >= deadline {
                    status = Err(Error::Timeout.into());
                    break;
                }
                let wake = thread.suspend();
                let sleep = kernel.clock.sleep_until(deadline);
                pin_mut!(wake);
                pin_mut!(sleep);
                match select(wake, sleep).await {
                    // Interrupted; loop around and look for the signal.
                    Either::Left(_) => {}
                    Either::Right(_) => {
                        status = Err(Error::Timeout.into());
                        break;
                    }
                }
            }
        }
    }

    if let Some(params) = caught {
        let mut apply = true;
        if operation == SignalMaskOperation::Clear {
            if let Some(number) = params.number {
                if set.contains(number) {
                    // The wake consumed it, but it is not delivered here:
                    // put it back for a later dispatch to take once
                    // unblocked.
                    apply = false;
                    status = Err(Error::Interrupted.into());
                    repost_signal(thread, &params).await;
                }
            }
        }
        if apply {
            arch::apply_synchronous_signal(thread, trap_frame, &params).await;
        }
        *parameters_out = Some(params);
    }

    if let Some(original) = restore_mask {
        let mut sig = proc.queued().lock().await;
        unsafe { thread.sig.assume_locked() }.blocked = original;
        signal::requeue_blocked_signals(&proc, &mut sig, thread);
    }

    status
}

async fn repost_signal(thread: &Arc<Thread>, params: &SignalParameters) {
    let number = match params.number {
        Some(number) => number,
        None => return,
    };
    if !number.is_queued() {
        let proc = thread.proc().clone();
        let _sig = proc.queued().lock().await;
        thread.pending.add(number);
        // The mask restore's replay publishes the unknown pending state,
        // forcing the next dispatch to take the full look.
    } else {
        let entry = SignalQueueEntry::new(
            SignalParameters {
                number: Some(number),
                ..*params
            },
            Completion::Release,
        );
        signal::signal_thread(thread, number, Some(entry), false).await;
    }
}
