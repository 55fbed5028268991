//! Queue entries: the rich payload form of a signal.
//!
//! An entry is shared between its creator and the queue holding it; the
//! `linked` variant replaces the classic null-next-pointer detachment
//! sentinel. The completion routine runs exactly once each time the entry
//! leaves the system.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};

use crate::{
    proc::{signal::SignalParameters, Proc, Tid},
    spinlock::SpinLock,
    syscall::Error,
};

/// Which list an entry currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichList {
    ProcessQueue,
    ThreadQueue(Tid),
    BlockedList,
}

pub struct EntryState {
    pub params: SignalParameters,
    /// Restricts delivery to one thread when set.
    pub destination_thread: Option<Tid>,
    /// Once true, the entry is no longer pending for fresh dispatch.
    pub delivered: bool,
    /// `None` means detached from every list.
    pub linked: Option<WhichList>,
}

/// What to do when the entry leaves the system.
pub enum Completion {
    /// Storage simply returns to the allocator when the last reference
    /// drops.
    Release,
    /// The per-process child-activity entry: unbinds the destination and
    /// may let the child be reclaimed.
    ChildSignal,
    /// Caller-supplied routine.
    Callback(Box<dyn Fn(&Arc<SignalQueueEntry>) + Send + Sync>),
}

pub struct SignalQueueEntry {
    state: SpinLock<EntryState>,
    completion: Completion,
    /// For the child-signal entry: the reference pinning the owning child
    /// process while the entry sits on a destination queue.
    pub(crate) owner: SpinLock<Option<Arc<Proc>>>,
}

impl SignalQueueEntry {
    pub fn new(params: SignalParameters, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(EntryState {
                params,
                destination_thread: None,
                delivered: false,
                linked: None,
            }),
            completion,
            owner: SpinLock::new(None),
        })
    }

    pub fn state(&self) -> spin::MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    pub fn params(&self) -> SignalParameters {
        self.state.lock().params
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked.is_some()
    }

    /// The child process owning this entry, while queued.
    pub fn owner(&self) -> Option<Arc<Proc>> {
        self.owner.lock().clone()
    }

    /// Runs the completion routine. The caller must have detached the entry
    /// first; each delivery runs this exactly once.
    pub fn complete(self: &Arc<Self>) {
        debug_assert!(!self.is_linked());
        match &self.completion {
            Completion::Release => {}
            Completion::ChildSignal => super::child_signal_completion(self),
            Completion::Callback(callback) => callback(self),
        }
    }
}

/// Appends the entry to `list`, recording which list holds it.
pub(crate) fn push_entry(
    list: &mut VecDeque<Arc<SignalQueueEntry>>,
    which: WhichList,
    entry: &Arc<SignalQueueEntry>,
) {
    debug_assert!(!entry.is_linked());
    entry.state.lock().linked = Some(which);
    list.push_back(entry.clone());
}

/// Detaches the entry from `list`. Returns false if it was not there.
pub(crate) fn unlink_entry(
    list: &mut VecDeque<Arc<SignalQueueEntry>>,
    entry: &Arc<SignalQueueEntry>,
) -> bool {
    match list.iter().position(|e| Arc::ptr_eq(e, entry)) {
        Some(index) => {
            list.remove(index);
            entry.state.lock().linked = None;
            true
        }
        None => false,
    }
}

/// Cancels a queued entry. Succeeds only while the entry is still linked;
/// an entry in service (or already served) returns `TooLate` and must not
/// be touched by the caller.
pub async fn cancel_queued_signal(
    proc: &Arc<Proc>,
    entry: &Arc<SignalQueueEntry>,
) -> Result<(), Error> {
    let mut sig = proc.queued().lock().await;
    let which = entry.state.lock().linked;
    let removed = match which {
        None => false,
        Some(WhichList::ProcessQueue) => unlink_entry(&mut sig.queue, entry),
        Some(WhichList::BlockedList) => unlink_entry(&mut sig.blocked_queue, entry),
        Some(WhichList::ThreadQueue(tid)) => match sig.threads.get(&tid).cloned() {
            Some(thread) => {
                let removed = unlink_entry(
                    &mut unsafe { thread.sig.assume_locked() }.queue,
                    entry,
                );
                thread.sync_queue_hint();
                removed
            }
            None => false,
        },
    };
    proc.sync_queue_hint(&sig);
    drop(sig);

    if removed {
        entry.complete();
        Ok(())
    } else {
        Err(Error::TooLate)
    }
}
