//! The parent/child activity reporting path.
//!
//! Every process owns exactly one reusable child-signal entry. A state
//! transition rebinds it to the parent's (or tracer's) queue; at most one
//! destination ever references it, enforced by detaching under the old
//! destination's lock before repopulating.

use alloc::sync::Arc;

use crate::{
    proc::{
        process::Proc,
        signal::{
            self,
            queue::{unlink_entry, SignalQueueEntry, WhichList},
            ChildSignalReason, SignalParameters, Signo,
        },
        Pid,
    },
    syscall::{Error, WaitFlags},
};

/// Queues the child's activity entry to the destination, detaching it from
/// any previous destination first.
pub async fn queue_child_signal(
    child: &Arc<Proc>,
    destination: &Arc<Proc>,
    status: usize,
    reason: ChildSignalReason,
) {
    // The kernel process never collects children.
    if destination.is_kernel() {
        debug_assert!(false, "child signal directed at the kernel process");
        return;
    }

    child.child_signal_lock.acquire().await;
    let entry = child.child_signal_entry().clone();

    if entry.is_linked() {
        let old_destination = child.child_signal_destination.lock().clone();
        if let Some(old) = old_destination {
            let mut sig = old.queued().lock().await;
            // Re-check under the destination lock; delivery may have
            // detached it meanwhile.
            let removed = match entry.state().linked {
                Some(WhichList::ProcessQueue) => unlink_entry(&mut sig.queue, &entry),
                Some(WhichList::BlockedList) => unlink_entry(&mut sig.blocked_queue, &entry),
                Some(WhichList::ThreadQueue(tid)) => match sig.threads.get(&tid).cloned() {
                    Some(thread) => {
                        let removed = unlink_entry(
                            &mut unsafe { thread.sig.assume_locked() }.queue,
                            &entry,
                        );
                        thread.sync_queue_hint();
                        removed
                    }
                    None => false,
                },
                None => false,
            };
            old.sync_queue_hint(&sig);
            drop(sig);
            if removed {
                // Drop the reference the old queue was holding.
                let _ = entry.owner.lock().take();
            }
        }
    }

    {
        let mut state = entry.state();
        state.params = SignalParameters {
            number: Some(Signo::ChildProcessActivity),
            code: reason.to_primitive() as i16,
            sending_process: child.id(),
            sending_user: 0,
            parameter: status,
        };
        state.destination_thread = None;
    }
    *child.child_signal_destination.lock() = Some(destination.clone());
    // The destination queue pins the child until completion.
    *entry.owner.lock() = Some(child.clone());
    signal::signal_process(destination, Signo::ChildProcessActivity, Some(entry)).await;

    child.child_signal_lock.release();
}

/// Reports the transition to the parent. Returns false when there is no
/// parent to tell.
pub async fn queue_child_signal_to_parent(
    child: &Arc<Proc>,
    status: usize,
    reason: ChildSignalReason,
) -> bool {
    match child.parent() {
        Some(parent) => {
            queue_child_signal(child, &parent, status, reason).await;
            true
        }
        None => false,
    }
}

/// Completion of a child-signal delivery: unbind the destination, and when
/// the consumed notification was the exit itself, let the child be
/// reclaimed.
pub(crate) fn child_signal_completion(entry: &Arc<SignalQueueEntry>) {
    let child = match entry.owner.lock().take() {
        Some(child) => child,
        None => return,
    };
    *child.child_signal_destination.lock() = None;

    let exit = child.exit_status();
    let params = entry.params();
    let was_exit_report = exit
        .reason
        .map_or(false, |reason| reason.to_primitive() as i16 == params.code)
        && exit.status == params.parameter;
    if was_exit_report {
        if let Some(parent) = child.parent() {
            parent.remove_child(child.id());
        }
        if let Some(kernel) = child.kernel() {
            kernel.remove_process(child.id());
        }
    }
    // The queue's pinning reference drops with `child`.
}

/// Checks that the wait selector names at least one existing child.
pub(crate) async fn validate_wait_parameters(proc: &Arc<Proc>, selector: Pid) -> Result<(), Error> {
    let children = proc.children();
    if selector == -1 {
        return if children.is_empty() {
            Err(Error::NoEligibleChildren)
        } else {
            Ok(())
        };
    }

    let matching_group = if selector == 0 {
        Some(proc.identifiers().process_group_id)
    } else if selector < -1 {
        Some(-selector)
    } else {
        None
    };

    for child in children {
        if child.id() == selector
            || matching_group == Some(child.identifiers().process_group_id)
        {
            return Ok(());
        }
    }
    Err(Error::NoEligibleChildren)
}

fn match_child_wait_request(
    current: &Arc<Proc>,
    selector: Pid,
    flags: WaitFlags,
    entry: &Arc<SignalQueueEntry>,
) -> bool {
    let params = entry.params();
    if params.number != Some(Signo::ChildProcessActivity) {
        return false;
    }

    let sender = params.sending_process;
    let matched = if selector > 0 {
        sender == selector
    } else if selector == -1 {
        true
    } else {
        let group = if selector == 0 {
            current.identifiers().process_group_id
        } else {
            -selector
        };
        current
            .children()
            .into_iter()
            .find(|child| child.id() == sender)
            .map_or(false, |child| child.identifiers().process_group_id == group)
    };
    if !matched {
        return false;
    }

    match ChildSignalReason::from_primitive(params.code as u16) {
        Some(ChildSignalReason::Exited)
        | Some(ChildSignalReason::Killed)
        | Some(ChildSignalReason::Dumped) => flags.contains(WaitFlags::EXITED_CHILDREN),
        Some(ChildSignalReason::Stopped) | Some(ChildSignalReason::Trapped) => {
            flags.contains(WaitFlags::STOPPED_CHILDREN)
        }
        Some(ChildSignalReason::Continued) => flags.contains(WaitFlags::CONTINUED_CHILDREN),
        None => {
            debug_assert!(false, "child signal without a reason");
            false
        }
    }
}

/// Pulls a child entry matching the selector and flags, blocked-deferred
/// list first. Unless asked not to, the entry is removed and an exited
/// child's usage is folded into the caller's child accounting.
pub async fn get_child_signal_entry(
    proc: &Arc<Proc>,
    selector: Pid,
    flags: WaitFlags,
) -> Option<Arc<SignalQueueEntry>> {
    let mut sig = proc.queued().lock().await;

    let mut found = sig
        .blocked_queue
        .iter()
        .find(|entry| match_child_wait_request(proc, selector, flags, entry))
        .cloned();
    if found.is_none() {
        // Child signals always queue process-wide; the thread queues can't
        // hold one.
        found = sig
            .queue
            .iter()
            .find(|entry| match_child_wait_request(proc, selector, flags, entry))
            .cloned();
    }
    let entry = found?;

    if !flags.contains(WaitFlags::DONT_DISCARD) {
        match entry.state().linked {
            Some(WhichList::ProcessQueue) => {
                unlink_entry(&mut sig.queue, &entry);
            }
            Some(WhichList::BlockedList) => {
                unlink_entry(&mut sig.blocked_queue, &entry);
            }
            _ => {}
        }
        proc.sync_queue_hint(&sig);

        if flags.contains(WaitFlags::EXITED_CHILDREN) {
            // The child has terminated; its counters are final.
            if let Some(child) = entry.owner() {
                let mut accumulated = proc.child_resource_usage.lock();
                accumulated.accumulate(&child.resource_usage.lock());
                accumulated.accumulate(&child.child_resource_usage.lock());
            }
        }
    }

    Some(entry)
}
