//! Signal numbers, set algebra, and the parameter block that travels with
//! every queued signal.

use core::sync::atomic::{AtomicU64, Ordering};

mod child;
mod dequeue;
mod queue;
mod send;
mod tracer;

#[cfg(test)]
mod tests;

pub use child::{get_child_signal_entry, queue_child_signal, queue_child_signal_to_parent};
pub use dequeue::{
    attempt_default_processing, check_for_non_maskable_signals, dequeue_pending_signal,
    dispatch_pending_signals, DequeuedSignal, DispatchResult,
};
pub use queue::{cancel_queued_signal, Completion, EntryState, SignalQueueEntry, WhichList};
pub use send::{
    check_send_signal_permission, is_thread_accepting_signal, send_signal_to_matching,
    signal_all_processes, signal_process, signal_process_with_params, signal_thread, ProcMatch,
};
pub use tracer::{
    attach_tracer, debug_command, detach_tracer, tracer_continue, tracer_signal_information,
    tracing_process, BreakRange, DebugCommand, DebugData,
};

pub(crate) use child::{child_signal_completion, validate_wait_parameters};
pub(crate) use dequeue::{mark_thread_stopped, wait_on_stop_event};
pub(crate) use send::{queue_signal, queue_signal_to_process, requeue_blocked_signals};
pub(crate) use tracer::tracer_break;

/// End of the standard (bitmap-represented) signal range.
pub const STANDARD_SIGNAL_COUNT: u8 = 32;

/// End of the whole signal range; numbers in
/// `STANDARD_SIGNAL_COUNT..SIGNAL_COUNT` are queued signals.
pub const SIGNAL_COUNT: u8 = 64;

num_enum::num_enum!(pub Signo: u8 {
    ControllingTerminalClosed = 1,
    KeyboardInterrupt = 2,
    RequestCoreDump = 3,
    IllegalInstruction = 4,
    Trap = 5,
    Abort = 6,
    BusError = 7,
    MathError = 8,
    Kill = 9,
    Application1 = 10,
    AccessViolation = 11,
    Application2 = 12,
    BrokenPipe = 13,
    Timer = 14,
    RequestTermination = 15,
    BadSystemCall = 16,
    ChildProcessActivity = 17,
    Continue = 18,
    Stop = 19,
    RequestStop = 20,
    BackgroundTerminalInput = 21,
    BackgroundTerminalOutput = 22,
    UrgentData = 23,
    CpuQuotaReached = 24,
    FileSizeTooLarge = 25,
    ExecutionTimerExpired = 26,
    ProfileTimer = 27,
    WindowChange = 28,
    AsynchronousIoComplete = 29,
    Rt32 = 32,
    Rt33 = 33,
    Rt34 = 34,
    Rt35 = 35,
    Rt36 = 36,
    Rt37 = 37,
    Rt38 = 38,
    Rt39 = 39,
    Rt40 = 40,
    Rt41 = 41,
    Rt42 = 42,
    Rt43 = 43,
    Rt44 = 44,
    Rt45 = 45,
    Rt46 = 46,
    Rt47 = 47,
    Rt48 = 48,
    Rt49 = 49,
    Rt50 = 50,
    Rt51 = 51,
    Rt52 = 52,
    Rt53 = 53,
    Rt54 = 54,
    Rt55 = 55,
    Rt56 = 56,
    Rt57 = 57,
    Rt58 = 58,
    Rt59 = 59,
    Rt60 = 60,
    Rt61 = 61,
    Rt62 = 62,
    Rt63 = 63,
});

impl Signo {
    /// True for signals represented by a queue entry rather than a bit.
    #[inline(always)]
    pub const fn is_queued(self) -> bool {
        self.to_primitive() >= STANDARD_SIGNAL_COUNT
    }

    /// Signals whose default action, absent a handler, is to discard.
    #[inline(always)]
    pub const fn is_default_ignore(self) -> bool {
        DEFAULT_IGNORE_SIGNALS.contains(self)
    }
}

/// The default-ignore class: child activity plus the urgent/informational
/// signals.
pub const DEFAULT_IGNORE_SIGNALS: SignalSet = SignalSet::mask(Signo::ChildProcessActivity)
    .union(SignalSet::mask(Signo::UrgentData))
    .union(SignalSet::mask(Signo::WindowChange));

/// Unhandled signals in this set bubble up to the kernel debugger.
pub const KERNEL_REPORTED_USER_SIGNALS: SignalSet = SignalSet::mask(Signo::Abort)
    .union(SignalSet::mask(Signo::BusError))
    .union(SignalSet::mask(Signo::MathError))
    .union(SignalSet::mask(Signo::IllegalInstruction))
    .union(SignalSet::mask(Signo::AccessViolation))
    .union(SignalSet::mask(Signo::BadSystemCall))
    .union(SignalSet::mask(Signo::Trap))
    .union(SignalSet::mask(Signo::RequestCoreDump))
    .union(SignalSet::mask(Signo::FileSizeTooLarge));

/// Default action: dump and terminate the process.
pub const DEFAULT_ABORT_SIGNALS: SignalSet = SignalSet::mask(Signo::Abort)
    .union(SignalSet::mask(Signo::BusError))
    .union(SignalSet::mask(Signo::MathError))
    .union(SignalSet::mask(Signo::IllegalInstruction))
    .union(SignalSet::mask(Signo::RequestCoreDump))
    .union(SignalSet::mask(Signo::AccessViolation))
    .union(SignalSet::mask(Signo::BadSystemCall))
    .union(SignalSet::mask(Signo::Trap))
    .union(SignalSet::mask(Signo::CpuQuotaReached))
    .union(SignalSet::mask(Signo::FileSizeTooLarge));

/// Default action: terminate the process.
pub const DEFAULT_TERMINATE_SIGNALS: SignalSet = SignalSet::mask(Signo::Timer)
    .union(SignalSet::mask(Signo::ControllingTerminalClosed))
    .union(SignalSet::mask(Signo::KeyboardInterrupt))
    .union(SignalSet::mask(Signo::BrokenPipe))
    .union(SignalSet::mask(Signo::RequestTermination))
    .union(SignalSet::mask(Signo::Application1))
    .union(SignalSet::mask(Signo::Application2))
    .union(SignalSet::mask(Signo::AsynchronousIoComplete))
    .union(SignalSet::mask(Signo::ProfileTimer))
    .union(SignalSet::mask(Signo::ExecutionTimerExpired));

/// Default action: stop the process.
pub const DEFAULT_STOP_SIGNALS: SignalSet = SignalSet::mask(Signo::RequestStop)
    .union(SignalSet::mask(Signo::BackgroundTerminalInput))
    .union(SignalSet::mask(Signo::BackgroundTerminalOutput));

/// A fixed-width bitset over signal numbers. Bit `n - 1` holds signal `n`;
/// signal 0 is "no signal" and has no bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline(always)]
    pub const fn mask(sig: Signo) -> Self {
        Self(1 << (sig.to_primitive() as u64 - 1))
    }

    #[inline(always)]
    pub const fn contains(self, sig: Signo) -> bool {
        self.0 & Self::mask(sig).0 != 0
    }

    #[inline(always)]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline(always)]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline(always)]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn add(&mut self, sig: Signo) {
        self.0 |= Self::mask(sig).0;
    }

    pub fn remove(&mut self, sig: Signo) {
        self.0 &= !Self::mask(sig).0;
    }

    /// Lowest-numbered signal in the set.
    pub fn lowest(self) -> Option<Signo> {
        if self.0 == 0 {
            return None;
        }
        Signo::from_primitive(self.0.trailing_zeros() as u8 + 1)
    }

    /// Iterates the set in ascending signal order.
    pub fn iter(self) -> impl Iterator<Item = Signo> {
        let mut bits = self.0;
        core::iter::from_fn(move || loop {
            if bits == 0 {
                return None;
            }
            let number = bits.trailing_zeros() as u8 + 1;
            bits &= bits - 1;
            // Reserved numbers carry no variant and cannot have been added.
            if let Some(sig) = Signo::from_primitive(number) {
                return Some(sig);
            }
        })
    }
}

/// A `SignalSet` whose bits may be read on the lock-free dequeue fast path.
///
/// All mutation happens under the owning process's queued lock; the atomic
/// representation only makes the unlocked reads well-defined. The producer
/// side publishes with a `SeqCst` fence before waking (see `send`), and the
/// consumer fences after clearing its pending state (see `dequeue`).
pub struct AtomicSignalSet(AtomicU64);

impl AtomicSignalSet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> SignalSet {
        SignalSet(self.0.load(Ordering::Acquire))
    }

    pub fn add(&self, sig: Signo) {
        self.0.fetch_or(SignalSet::mask(sig).0, Ordering::AcqRel);
    }

    pub fn remove(&self, sig: Signo) {
        self.0.fetch_and(!SignalSet::mask(sig).0, Ordering::AcqRel);
    }

    pub fn contains(&self, sig: Signo) -> bool {
        self.load().contains(sig)
    }
}

impl Default for AtomicSignalSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Reason codes carried by a child-activity signal.
num_enum::num_enum!(pub ChildSignalReason: u16 {
    Exited = 1,
    Killed = 2,
    Dumped = 3,
    Stopped = 4,
    Trapped = 5,
    Continued = 6,
});

impl ChildSignalReason {
    pub const fn is_exit(self) -> bool {
        matches!(
            self,
            ChildSignalReason::Exited | ChildSignalReason::Killed | ChildSignalReason::Dumped
        )
    }
}

/// Code carried by user-originated sends.
pub const SIGNAL_CODE_USER: i16 = 0;

/// The rich payload of a signal. `number` is `None` only while a tracer has
/// suppressed the signal in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalParameters {
    pub number: Option<Signo>,
    pub code: i16,
    pub sending_process: crate::proc::Pid,
    pub sending_user: crate::proc::Uid,
    pub parameter: usize,
}

impl SignalParameters {
    pub fn new(number: Signo) -> Self {
        Self {
            number: Some(number),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_algebra() {
        let mut set = SignalSet::empty();
        assert!(set.is_empty());
        set.add(Signo::Kill);
        set.add(Signo::Stop);
        assert!(set.contains(Signo::Kill));
        assert!(!set.contains(Signo::Continue));
        set.remove(Signo::Kill);
        assert!(!set.contains(Signo::Kill));
        assert_eq!(set, SignalSet::mask(Signo::Stop));

        let other = SignalSet::mask(Signo::Trap).union(SignalSet::mask(Signo::Stop));
        assert_eq!(
            set.union(other),
            SignalSet::mask(Signo::Trap).union(SignalSet::mask(Signo::Stop))
        );
        assert_eq!(set.difference(other), SignalSet::empty());
        assert_eq!(set.intersection(other), SignalSet::mask(Signo::Stop));
    }

    #[test]
    fn lowest_prefers_smaller_numbers() {
        let set = SignalSet::mask(Signo::Stop)
            .union(SignalSet::mask(Signo::Trap))
            .union(SignalSet::mask(Signo::Rt40));
        assert_eq!(set.lowest(), Some(Signo::Trap));
        assert_eq!(SignalSet::empty().lowest(), None);
    }

    #[test]
    fn ascending_iteration() {
        let set = SignalSet::mask(Signo::Rt63)
            .union(SignalSet::mask(Signo::KeyboardInterrupt))
            .union(SignalSet::mask(Signo::Continue));
        let order: alloc::vec::Vec<Signo> = set.iter().collect();
        assert_eq!(
            order,
            vec![Signo::KeyboardInterrupt, Signo::Continue, Signo::Rt63]
        );
    }

    #[test]
    fn signal_ranges() {
        assert!(!Signo::AsynchronousIoComplete.is_queued());
        assert!(Signo::Rt32.is_queued());
        assert_eq!(Signo::from_primitive(0), None);
        assert_eq!(Signo::from_primitive(30), None);
        assert_eq!(Signo::from_primitive(SIGNAL_COUNT), None);
    }

    #[test]
    fn name_table() {
        assert_eq!(Signo::Kill.name(), "Kill");
        assert_eq!(Signo::ChildProcessActivity.name(), "ChildProcessActivity");
    }

    #[test]
    fn default_classes_are_disjoint() {
        assert!(DEFAULT_ABORT_SIGNALS
            .intersection(DEFAULT_TERMINATE_SIGNALS)
            .is_empty());
        assert!(DEFAULT_ABORT_SIGNALS
            .intersection(DEFAULT_STOP_SIGNALS)
            .is_empty());
        assert!(DEFAULT_STOP_SIGNALS
            .intersection(DEFAULT_IGNORE_SIGNALS)
            .is_empty());
        assert!(Signo::ChildProcessActivity.is_default_ignore());
        assert!(!Signo::Kill.is_default_ignore());
    }
}
