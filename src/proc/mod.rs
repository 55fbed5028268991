pub mod process;
pub mod signal;
pub mod thread;

pub use process::{ExitStatus, Identifiers, Kernel, Proc, ProcSig, ResourceUsage};
pub use thread::{SignalPendingState, Thread, ThreadSig};

pub type Pid = i32;
pub type Tid = u32;
pub type Uid = u32;

bitflags! {
    /// Capability overrides held by a thread's identity.
    pub struct Capabilities: u32 {
        /// Permits signalling any process.
        const KILL = 0b1;
    }
}

/// Real, effective and saved user identity, used for send permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub real_user: Uid,
    pub effective_user: Uid,
    pub saved_user: Uid,
    pub capabilities: Capabilities,
}

impl Identity {
    pub fn user(uid: Uid) -> Self {
        Self {
            real_user: uid,
            effective_user: uid,
            saved_user: uid,
            capabilities: Capabilities::empty(),
        }
    }

    pub fn root() -> Self {
        Self {
            real_user: 0,
            effective_user: 0,
            saved_user: 0,
            capabilities: Capabilities::all(),
        }
    }
}
