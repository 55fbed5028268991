use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashMap;

use crate::{
    config,
    kd::KdState,
    proc::{
        signal::{
            self, AtomicSignalSet, ChildSignalReason, Completion, DebugData, SignalParameters,
            SignalQueueEntry, SignalSet, Signo,
        },
        thread::Thread,
        Identity, Pid, Tid,
    },
    sleeplock::{Event, QueuedLock},
    spinlock::{SpinFlag, SpinLock},
    time::Clock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifiers {
    pub process_id: Pid,
    pub process_group_id: Pid,
    pub session_id: Pid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub reason: Option<ChildSignalReason>,
    pub status: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: u64,
    pub kernel_time: u64,
    pub page_faults: u64,
}

impl ResourceUsage {
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.user_time += other.user_time;
        self.kernel_time += other.kernel_time;
        self.page_faults += other.page_faults;
    }
}

/// Process signal state guarded by the queued lock.
pub struct ProcSig {
    pub ignored: SignalSet,
    pub handled: SignalSet,
    /// User-mode signal handler trampoline, if one is registered.
    pub handler: Option<usize>,
    /// Process-wide queue entries.
    pub queue: VecDeque<Arc<SignalQueueEntry>>,
    /// Entries temporarily ineligible for delivery (blocked, or parked
    /// child signals awaiting a wait call).
    pub blocked_queue: VecDeque<Arc<SignalQueueEntry>>,
    pub threads: BTreeMap<Tid, Arc<Thread>>,
}

pub struct Proc {
    identifiers: Identifiers,
    name: String,
    identity: Identity,
    kernel: Weak<Kernel>,
    queued: QueuedLock<ProcSig>,
    /// Standard signals posted process-wide. Mutated under the queued lock,
    /// readable on the lock-free fast path.
    pub pending: AtomicSignalSet,
    /// Lock-free hint that the process queue is non-empty.
    pub queue_nonempty: AtomicBool,
    /// Unsignaled while the process must be stopped.
    pub stop_event: Event,
    pub thread_count: AtomicUsize,
    pub stopped_thread_count: AtomicUsize,
    debug: spin::Once<Arc<DebugData>>,
    // The reusable child-activity entry and its rebinding state.
    child_signal: spin::Once<Arc<SignalQueueEntry>>,
    pub child_signal_lock: SpinFlag,
    pub child_signal_destination: SpinLock<Option<Arc<Proc>>>,
    parent: SpinLock<Option<Weak<Proc>>>,
    children: SpinLock<BTreeMap<Pid, Arc<Proc>>>,
    exit: SpinLock<ExitStatus>,
    pub resource_usage: SpinLock<ResourceUsage>,
    pub child_resource_usage: SpinLock<ResourceUsage>,
}

impl Proc {
    fn new(kernel: &Arc<Kernel>, identifiers: Identifiers, name: String, identity: Identity) -> Self {
        Self {
            identifiers,
            name,
            identity,
            kernel: Arc::downgrade(kernel),
            queued: QueuedLock::new(ProcSig {
                ignored: SignalSet::empty(),
                handled: SignalSet::empty(),
                handler: None,
                queue: VecDeque::new(),
                blocked_queue: VecDeque::new(),
                threads: BTreeMap::new(),
            }),
            pending: AtomicSignalSet::new(),
            queue_nonempty: AtomicBool::new(false),
            // A running process is not stopped.
            stop_event: Event::new(true),
            thread_count: AtomicUsize::new(0),
            stopped_thread_count: AtomicUsize::new(0),
            debug: spin::Once::new(),
            child_signal: spin::Once::new(),
            child_signal_lock: SpinFlag::new(),
            child_signal_destination: SpinLock::new(None),
            parent: SpinLock::new(None),
            children: SpinLock::new(BTreeMap::new()),
            exit: SpinLock::new(ExitStatus::default()),
            resource_usage: SpinLock::new(ResourceUsage::default()),
            child_resource_usage: SpinLock::new(ResourceUsage::default()),
        }
    }

    pub fn id(&self) -> Pid {
        self.identifiers.process_id
    }

    pub fn identifiers(&self) -> &Identifiers {
        &self.identifiers
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_kernel(&self) -> bool {
        self.identifiers.process_id == config::KERNEL_PROCESS_ID
    }

    pub fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.upgrade()
    }

    pub fn queued(&self) -> &QueuedLock<ProcSig> {
        &self.queued
    }

    pub(crate) fn sync_queue_hint(&self, sig: &ProcSig) {
        // Caller holds the queued lock; `sig` proves it.
        self.queue_nonempty
            .store(!sig.queue.is_empty(), Ordering::Release);
    }

    pub fn debug_data(&self) -> Option<&Arc<DebugData>> {
        self.debug.get()
    }

    pub(crate) fn ensure_debug_data(&self) -> &Arc<DebugData> {
        self.debug.call_once(|| Arc::new(DebugData::new()))
    }

    pub fn child_signal_entry(&self) -> &Arc<SignalQueueEntry> {
        self.child_signal
            .get()
            .expect("child signal entry not initialized")
    }

    pub fn parent(&self) -> Option<Arc<Proc>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Proc>> {
        self.children.lock().values().cloned().collect()
    }

    pub(crate) fn remove_child(&self, pid: Pid) {
        self.children.lock().remove(&pid);
    }

    pub fn exit_status(&self) -> ExitStatus {
        *self.exit.lock()
    }

    /// Records the exit disposition. Terminal reasons stick: a dump reason
    /// set by default processing is not overwritten by the ensuing
    /// process-wide kill. Stop/continue reasons may be replaced.
    pub fn set_exit_status(&self, reason: ChildSignalReason, status: usize) -> bool {
        let mut exit = self.exit.lock();
        match exit.reason {
            Some(existing) if existing.is_exit() => false,
            _ => {
                exit.reason = Some(reason);
                exit.status = status;
                true
            }
        }
    }
}

/// Process table, identifier allocation, the clock and the kernel-debugger
/// probes: the collaborators every signal path reaches through.
pub struct Kernel {
    procs: SpinLock<HashMap<Pid, Arc<Proc>>>,
    kernel_proc: spin::Once<Arc<Proc>>,
    next_id: AtomicI32,
    pub clock: Clock,
    pub kd: KdState,
}

impl Kernel {
    pub fn new() -> Arc<Self> {
        let kernel = Arc::new(Self {
            procs: SpinLock::new(HashMap::new()),
            kernel_proc: spin::Once::new(),
            next_id: AtomicI32::new(1),
            clock: Clock::new(),
            kd: KdState::new(),
        });

        let identifiers = Identifiers {
            process_id: config::KERNEL_PROCESS_ID,
            process_group_id: config::KERNEL_PROCESS_ID,
            session_id: config::KERNEL_PROCESS_ID,
        };
        let kproc = Arc::new(Proc::new(&kernel, identifiers, String::from("kernel"), Identity::root()));
        kproc.child_signal.call_once(|| {
            SignalQueueEntry::new(
                SignalParameters::new(Signo::ChildProcessActivity),
                Completion::ChildSignal,
            )
        });
        kernel.procs.lock().insert(kproc.id(), kproc.clone());
        kernel.kernel_proc.call_once(|| kproc);
        kernel
    }

    pub fn kernel_process(&self) -> &Arc<Proc> {
        self.kernel_proc.get().expect("kernel process missing")
    }

    fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn create_process(
        self: &Arc<Self>,
        name: impl Into<String>,
        identity: Identity,
        parent: Option<&Arc<Proc>>,
    ) -> Arc<Proc> {
        self.create_process_with(name, identity, parent, None)
    }

    /// Creates a process, optionally placing it in an explicit process
    /// group and session instead of inheriting the parent's.
    pub fn create_process_with(
        self: &Arc<Self>,
        name: impl Into<String>,
        identity: Identity,
        parent: Option<&Arc<Proc>>,
        group: Option<(Pid, Pid)>,
    ) -> Arc<Proc> {
        let pid = self.allocate_id();
        let (process_group_id, session_id) = match (group, parent) {
            (Some((pgid, sid)), _) => (pgid, sid),
            (None, Some(parent)) => (
                parent.identifiers.process_group_id,
                parent.identifiers.session_id,
            ),
            (None, None) => (pid, pid),
        };
        let identifiers = Identifiers {
            process_id: pid,
            process_group_id,
            session_id,
        };

        let proc = Arc::new(Proc::new(self, identifiers, name.into(), identity));
        proc.child_signal.call_once(|| {
            SignalQueueEntry::new(
                SignalParameters::new(Signo::ChildProcessActivity),
                Completion::ChildSignal,
            )
        });

        if let Some(parent) = parent {
            *proc.parent.lock() = Some(Arc::downgrade(parent));
            parent.children.lock().insert(pid, proc.clone());
        }
        self.procs.lock().insert(pid, proc.clone());
        proc
    }

    pub async fn create_thread(&self, proc: &Arc<Proc>, name: impl Into<String>) -> Arc<Thread> {
        let tid = self.allocate_id() as Tid;
        let thread = Arc::new(Thread::new(tid, name, *proc.identity()));
        thread.bind_proc(proc.clone());
        let mut sig = proc.queued().lock().await;
        sig.threads.insert(tid, thread.clone());
        proc.thread_count.fetch_add(1, Ordering::AcqRel);
        drop(sig);
        thread
    }

    pub fn get_process_by_id(&self, pid: Pid) -> Option<Arc<Proc>> {
        self.procs.lock().get(&pid).cloned()
    }

    /// Snapshot of every registered process, kernel process included;
    /// iterating callers skip it.
    pub fn processes(&self) -> Vec<Arc<Proc>> {
        self.procs.lock().values().cloned().collect()
    }

    pub(crate) fn remove_process(&self, pid: Pid) {
        self.procs.lock().remove(&pid);
    }
}

/// Looks up a thread of the process by identifier.
pub async fn get_thread_by_id(proc: &Arc<Proc>, tid: Tid) -> Option<Arc<Thread>> {
    proc.queued().lock().await.threads.get(&tid).cloned()
}

/// Tears down the calling thread: unlinks it, and when it was the last
/// thread of the process, reports the exit to the parent. Callers must not
/// run the thread again.
pub async fn exit_thread(thread: &Arc<Thread>) {
    let proc = thread.proc().clone();
    thread.set_exited();

    let mut sig = proc.queued().lock().await;
    sig.threads.remove(&thread.id());
    let remaining = proc.thread_count.fetch_sub(1, Ordering::AcqRel) - 1;

    // A collection in progress may have been waiting on this thread.
    if let Some(debug) = proc.debug_data() {
        if debug.is_tracer_stop_requested()
            && remaining > 0
            && proc.stopped_thread_count.load(Ordering::Acquire) == remaining
        {
            debug.all_stopped_event.signal_all();
        }
    }
    drop(sig);

    if remaining == 0 {
        let status = proc.exit_status();
        let (reason, value) = match status.reason {
            Some(reason) => (reason, status.status),
            None => {
                proc.set_exit_status(ChildSignalReason::Exited, 0);
                (ChildSignalReason::Exited, 0)
            }
        };
        if !signal::queue_child_signal_to_parent(&proc, value, reason).await {
            // No parent to reap the process; drop it from the table now.
            if let Some(kernel) = proc.kernel() {
                kernel.remove_process(proc.id());
            }
        }
    }
}
