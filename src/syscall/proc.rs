use alloc::sync::Arc;

use crate::proc::{self, signal::ChildSignalReason, Thread};

/// Voluntary exit of the calling thread. When it is the last thread of the
/// process, the recorded status becomes the process exit report.
pub async fn sys_exit(thread: &Arc<Thread>, status: usize) {
    thread
        .proc()
        .set_exit_status(ChildSignalReason::Exited, status);
    proc::process::exit_thread(thread).await;
}
