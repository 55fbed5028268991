use crate::proc::{signal::ChildSignalReason, Pid, ResourceUsage};

mod proc;
mod signal;

pub use proc::sys_exit;
pub use signal::{
    set_signal_mask, sys_restore_context, sys_send_signal, sys_set_signal_behavior,
    sys_set_signal_handler, sys_suspend_execution, sys_wait_for_child, SuspendTimeout,
};

/// Error kinds surfaced to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidParameter,
    NoSuchThread,
    NoSuchProcess,
    NoEligibleChildren,
    NoDataAvailable,
    AccessDenied,
    PermissionDenied,
    InsufficientResources,
    Interrupted,
    Timeout,
    TooLate,
    NotImplemented,
}

/// A system call either completes with a status or never returns because
/// the calling thread was killed while dispatching signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    Failed(Error),
    /// The thread observed a pending kill; the caller must tear it down
    /// and never resume user mode.
    Terminated,
}

impl From<Error> for SysError {
    fn from(error: Error) -> Self {
        SysError::Failed(error)
    }
}

pub type SysResult<T> = core::result::Result<T, SysError>;

num_enum::num_enum!(pub SignalTarget: u8 {
    Thread = 0,
    CurrentProcess = 1,
    Process = 2,
    CurrentProcessGroup = 3,
    ProcessGroup = 4,
    AllProcesses = 5,
});

num_enum::num_enum!(pub SignalMaskType: u8 {
    Blocked = 0,
    Ignored = 1,
    Handled = 2,
    Pending = 3,
});

num_enum::num_enum!(pub SignalMaskOperation: u8 {
    None = 0,
    Overwrite = 1,
    Set = 2,
    Clear = 3,
});

bitflags! {
    pub struct WaitFlags: u32 {
        const EXITED_CHILDREN = 0x1;
        const STOPPED_CHILDREN = 0x2;
        const CONTINUED_CHILDREN = 0x4;
        const RETURN_IMMEDIATELY = 0x8;
        const DONT_DISCARD = 0x10;
        const CHILD_MASK = Self::EXITED_CHILDREN.bits
            | Self::STOPPED_CHILDREN.bits
            | Self::CONTINUED_CHILDREN.bits;
    }
}

/// Send-signal request block.
#[derive(Debug, Clone, Copy)]
pub struct SendSignal {
    pub target_type: SignalTarget,
    pub target_id: Pid,
    pub signal_number: u8,
    pub signal_code: i16,
    pub signal_parameter: usize,
}

/// Successful wait-for-child report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEvent {
    pub pid: Pid,
    pub reason: ChildSignalReason,
    pub exit_value: usize,
    pub resource_usage: ResourceUsage,
}
