//! Scenario tests: whole-subsystem interleavings driven deterministically
//! on the executor. Each test spawns kernel-thread bodies as tasks, runs
//! the executor until every task parks, then acts and observes.

use alloc::sync::Arc;

use executor::fifo::FIFOExecutor;

use crate::{
    arch::TrapFrame,
    proc::{
        process::{self, Kernel, ResourceUsage},
        signal::{
            self, queue::Completion, tracer, ChildSignalReason, DispatchResult, SignalParameters,
            SignalQueueEntry, SignalSet, Signo,
        },
        thread::SignalPendingState,
        Identity, Proc, Thread,
    },
    spinlock::RawSpinLock,
    syscall::{
        self, Error, SendSignal, SignalMaskOperation, SignalMaskType, SignalTarget, SysError,
        SuspendTimeout, WaitFlags,
    },
};

type Exec = FIFOExecutor<RawSpinLock>;

fn exec() -> Exec {
    FIFOExecutor::new(crate::config::TASK_QUEUE_SIZE)
}

fn block_on<F: core::future::Future>(fut: F) -> F::Output {
    executor::block_on(fut)
}

type Cell<T> = Arc<spin::Mutex<Option<T>>>;

fn cell<T>() -> Cell<T> {
    Arc::new(spin::Mutex::new(None))
}

/// One process with one thread, handler installed, the given signals
/// marked handled.
async fn user_process(
    kernel: &Arc<Kernel>,
    name: &str,
    identity: Identity,
    handled: SignalSet,
) -> (Arc<Proc>, Arc<Thread>) {
    let proc = kernel.create_process(name, identity, None);
    let thread = kernel.create_thread(&proc, name).await;
    if !handled.is_empty() {
        syscall::sys_set_signal_handler(&thread, Some(0x1000)).await;
        syscall::sys_set_signal_behavior(
            &thread,
            SignalMaskType::Handled,
            SignalMaskOperation::Set,
            handled,
        )
        .await;
    }
    (proc, thread)
}

/// The return-to-user loop: dispatch until idle, then sleep
/// interruptibly. Exits the thread when a kill lands.
fn spawn_user_loop(ex: &Exec, thread: Arc<Thread>) -> u64 {
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        loop {
            match signal::dispatch_pending_signals(&thread, &mut trap_frame).await {
                DispatchResult::Terminated => {
                    process::exit_thread(&thread).await;
                    return;
                }
                DispatchResult::Delivered(_) => continue,
                DispatchResult::None => {}
            }
            thread.interruptible_block().await;
        }
    })
}

#[test]
fn deliver_standard_signal_to_handler() {
    let kernel = Kernel::new();
    let (proc, thread) = block_on(user_process(
        &kernel,
        "app",
        Identity::user(1000),
        SignalSet::mask(Signo::Application1),
    ));

    block_on(signal::signal_thread(&thread, Signo::Application1, None, false));
    assert!(thread.pending.contains(Signo::Application1));
    assert_eq!(thread.signal_pending_state(), SignalPendingState::Any);

    let mut trap_frame = TrapFrame::default();
    let result = block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame));
    assert_eq!(result, DispatchResult::Delivered(Signo::Application1));
    assert_eq!(trap_frame.instruction_pointer, 0x1000);
    assert!(!thread.pending.contains(Signo::Application1));

    // The handler frame is live until the context restore.
    {
        let sig = block_on(proc.queued().lock());
        assert!(unsafe { thread.sig.assume_locked() }
            .running
            .contains(Signo::Application1));
        drop(sig);
    }
    block_on(syscall::sys_restore_context(&thread, &mut trap_frame));
    assert_eq!(trap_frame.instruction_pointer, 0);
    let sig = block_on(proc.queued().lock());
    assert!(unsafe { thread.sig.assume_locked() }.running.is_empty());
    drop(sig);
}

#[test]
fn blocked_signal_is_deferred_until_unblocked() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Application1).union(SignalSet::mask(Signo::Rt40));
    let (proc, thread) = block_on(user_process(&kernel, "app", Identity::user(1), handled));

    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Blocked,
        SignalMaskOperation::Set,
        handled,
    ));

    // A bare number parks as a pending bit; an entry parks on the
    // blocked-deferred list.
    block_on(signal::signal_thread(&thread, Signo::Application1, None, false));
    let entry = SignalQueueEntry::new(
        SignalParameters {
            number: Some(Signo::Rt40),
            code: -1,
            sending_process: proc.id(),
            sending_user: 1,
            parameter: 99,
        },
        Completion::Release,
    );
    block_on(signal::signal_thread(&thread, Signo::Rt40, Some(entry.clone()), false));

    let mut trap_frame = TrapFrame::default();
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::None
    );
    assert!(entry.is_linked());
    assert!(!entry.state().delivered);
    assert!(!block_on(signal::is_thread_accepting_signal(
        &thread,
        Signo::Application1
    )));

    // Both show up in the pending read.
    let pending = block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Pending,
        SignalMaskOperation::None,
        SignalSet::empty(),
    ));
    assert!(pending.contains(Signo::Application1));
    assert!(pending.contains(Signo::Rt40));

    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Blocked,
        SignalMaskOperation::Clear,
        handled,
    ));

    // Lower-numbered standard signal first, then the queued entry.
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Application1)
    );
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Rt40)
    );
    assert!(entry.state().delivered);
    assert!(!entry.is_linked());
}

#[test]
fn stop_and_continue_barrier_with_parent_notification() {
    let kernel = Kernel::new();
    let (_parent, waiter) = block_on(user_process(
        &kernel,
        "parent",
        Identity::user(7),
        SignalSet::empty(),
    ));
    let parent = waiter.proc().clone();

    let child = kernel.create_process("child", Identity::user(7), Some(&parent));
    let threads: alloc::vec::Vec<Arc<Thread>> = (0..3)
        .map(|i| block_on(kernel.create_thread(&child, format!("worker{}", i))))
        .collect();

    let ex = exec();
    for thread in &threads {
        spawn_user_loop(&ex, thread.clone());
    }
    ex.run_until_idle();

    // Stop the whole process: every thread parks at the barrier and the
    // parent hears about it once.
    block_on(signal::signal_process(&child, Signo::Stop, None));
    ex.run_until_idle();
    assert_eq!(
        child.stopped_thread_count.load(core::sync::atomic::Ordering::Acquire),
        3
    );
    assert!(!child.stop_event.is_signaled());

    let stopped = cell();
    let stopped_out = stopped.clone();
    let wait_thread = waiter.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let result = syscall::sys_wait_for_child(
            &wait_thread,
            &mut trap_frame,
            -1,
            WaitFlags::STOPPED_CHILDREN | WaitFlags::RETURN_IMMEDIATELY,
        )
        .await;
        *stopped_out.lock() = Some(result);
    });
    ex.run_until_idle();
    let event = stopped.lock().take().expect("wait ran").expect("stop reported");
    assert_eq!(event.pid, child.id());
    assert_eq!(event.reason, ChildSignalReason::Stopped);
    assert_eq!(event.exit_value, Signo::Stop.to_primitive() as usize);

    // Continue: all three drain, and the parent hears the resume.
    block_on(signal::signal_process(&child, Signo::Continue, None));
    ex.run_until_idle();
    assert_eq!(
        child.stopped_thread_count.load(core::sync::atomic::Ordering::Acquire),
        0
    );
    assert!(child.stop_event.is_signaled());

    let continued = cell();
    let continued_out = continued.clone();
    let wait_thread = waiter.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let result = syscall::sys_wait_for_child(
            &wait_thread,
            &mut trap_frame,
            -1,
            WaitFlags::CONTINUED_CHILDREN | WaitFlags::RETURN_IMMEDIATELY,
        )
        .await;
        *continued_out.lock() = Some(result);
    });
    ex.run_until_idle();
    let event = continued
        .lock()
        .take()
        .expect("wait ran")
        .expect("continue reported");
    assert_eq!(event.pid, child.id());
    assert_eq!(event.reason, ChildSignalReason::Continued);
}

#[test]
fn tracer_single_step_trap_round_trip() {
    let kernel = Kernel::new();
    let (_tracer_proc, tracer_thread) = block_on(user_process(
        &kernel,
        "debugger",
        Identity::user(0),
        SignalSet::empty(),
    ));
    let tracer_proc = tracer_thread.proc().clone();

    // The debugger has forked the tracee, so it is also the parent.
    let tracee = kernel.create_process("tracee", Identity::user(5), Some(&tracer_proc));
    let tracee_thread = block_on(kernel.create_thread(&tracee, "tracee"));
    tracer::attach_tracer(&tracee, &tracer_proc);

    // The previous command was a single step; the trap comes back with
    // the step flag armed.
    tracer::tracer_continue(&tracee, tracer::DebugCommand::SingleStep, None, None);

    let finished = cell();
    let finished_out = finished.clone();
    let ex = exec();
    let thread = tracee_thread.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame {
            instruction_pointer: 0x4000,
            stack_pointer: 0,
            single_step: true,
        };
        signal::signal_thread(&thread, Signo::Trap, None, false).await;
        let result = signal::dispatch_pending_signals(&thread, &mut trap_frame).await;
        *finished_out.lock() = Some((result, trap_frame));
    });
    ex.run_until_idle();

    // The tracee is parked in the break; the report reached the tracer and
    // the command is latched invalid until the tracer answers.
    assert!(finished.lock().is_none());
    let info = tracer::tracer_signal_information(&tracee).expect("debug data");
    assert_eq!(info.number, Some(Signo::Trap));
    assert_eq!(
        tracer::debug_command(&tracee),
        Some(tracer::DebugCommand::Invalid)
    );

    let report = cell();
    let report_out = report.clone();
    let wait_thread = tracer_thread.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let result = syscall::sys_wait_for_child(
            &wait_thread,
            &mut trap_frame,
            -1,
            WaitFlags::STOPPED_CHILDREN | WaitFlags::DONT_DISCARD,
        )
        .await;
        *report_out.lock() = Some(result);
    });
    ex.run_until_idle();
    let event = report.lock().take().expect("wait ran").expect("trap reported");
    assert_eq!(event.reason, ChildSignalReason::Trapped);
    assert_eq!(event.exit_value, Signo::Trap.to_primitive() as usize);

    // The tracer suppresses the trap; the tracee resumes with nothing
    // delivered and single-step cleared.
    tracer::tracer_continue(&tracee, tracer::DebugCommand::Continue, None, None);
    ex.run_until_idle();

    let (result, trap_frame) = finished.lock().take().expect("tracee resumed");
    assert_eq!(result, DispatchResult::None);
    assert!(!trap_frame.single_step);
    assert_eq!(trap_frame.instruction_pointer, 0x4000);
    assert_eq!(
        tracee
            .stopped_thread_count
            .load(core::sync::atomic::Ordering::Acquire),
        0
    );
    assert!(tracee_thread.inner.lock().pre_signal.is_empty());
}

#[test]
fn process_send_skips_blocking_thread() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Application1);
    let (proc, blocker) = block_on(user_process(&kernel, "app", Identity::user(3), handled));
    let open = block_on(kernel.create_thread(&proc, "open"));

    block_on(syscall::sys_set_signal_behavior(
        &blocker,
        SignalMaskType::Blocked,
        SignalMaskOperation::Set,
        SignalSet::mask(Signo::Application1),
    ));

    let blocker_saw = cell();
    let open_saw = cell();
    let ex = exec();
    let workers = vec![
        (blocker.clone(), blocker_saw.clone()),
        (open.clone(), open_saw.clone()),
    ];
    for (thread, out) in workers {
        ex.spawn(async move {
            let mut trap_frame = TrapFrame::default();
            thread.interruptible_block().await;
            let result = signal::dispatch_pending_signals(&thread, &mut trap_frame).await;
            *out.lock() = Some(result);
        });
    }
    ex.run_until_idle();

    block_on(signal::signal_process(&proc, Signo::Application1, None));
    ex.run_until_idle();

    // Only the thread that does not block the signal woke and delivered.
    assert_eq!(
        open_saw.lock().take(),
        Some(DispatchResult::Delivered(Signo::Application1))
    );
    assert!(blocker_saw.lock().is_none());
    assert_eq!(blocker.signal_pending_state(), SignalPendingState::Unknown);

    // Unrelated wake: the blocker finds nothing deliverable.
    blocker.wake(false);
    ex.run_until_idle();
    assert_eq!(blocker_saw.lock().take(), Some(DispatchResult::None));
}

#[test]
fn send_permission_rules() {
    let kernel = Kernel::new();
    let (_proc, sender) = block_on(user_process(
        &kernel,
        "sender",
        Identity::user(1000),
        SignalSet::empty(),
    ));

    let target_identity = Identity {
        real_user: 2000,
        effective_user: 2000,
        saved_user: 1000,
        capabilities: crate::proc::Capabilities::empty(),
    };
    let target = kernel.create_process("target", target_identity, None);
    let _target_thread = block_on(kernel.create_thread(&target, "t"));

    // Sender real uid matches the target's saved uid.
    assert!(signal::check_send_signal_permission(
        &sender,
        &target,
        Some(Signo::RequestTermination)
    )
    .is_ok());

    let stranger = kernel.create_process("stranger", Identity::user(3000), None);
    let _stranger_thread = block_on(kernel.create_thread(&stranger, "t"));
    assert_eq!(
        signal::check_send_signal_permission(&sender, &stranger, Some(Signo::RequestTermination)),
        Err(Error::PermissionDenied)
    );

    // Continue is allowed within the session.
    let sibling = kernel.create_process("sibling", Identity::user(4000), Some(sender.proc()));
    let _sibling_thread = block_on(kernel.create_thread(&sibling, "t"));
    assert!(
        signal::check_send_signal_permission(&sender, &sibling, Some(Signo::Continue)).is_ok()
    );
    assert_eq!(
        signal::check_send_signal_permission(&sender, &sibling, Some(Signo::RequestTermination)),
        Err(Error::PermissionDenied)
    );

    // The kill capability overrides everything.
    let root = block_on(kernel.create_thread(
        &kernel.create_process("root", Identity::root(), None),
        "root",
    ));
    assert!(signal::check_send_signal_permission(
        &root,
        &stranger,
        Some(Signo::RequestTermination)
    )
    .is_ok());
}

#[test]
fn wait_reaps_exited_child_and_accumulates_usage() {
    let kernel = Kernel::new();
    let (_p, waiter) = block_on(user_process(
        &kernel,
        "parent",
        Identity::user(9),
        SignalSet::empty(),
    ));
    let parent = waiter.proc().clone();
    let child = kernel.create_process("child", Identity::user(9), Some(&parent));
    let child_thread = block_on(kernel.create_thread(&child, "child"));
    *child.resource_usage.lock() = ResourceUsage {
        user_time: 40,
        kernel_time: 2,
        page_faults: 11,
    };
    let child_pid = child.id();

    let ex = exec();
    let exiting = child_thread.clone();
    ex.spawn(async move {
        syscall::sys_exit(&exiting, 42).await;
    });
    ex.run_until_idle();

    assert_eq!(
        child.exit_status().reason,
        Some(ChildSignalReason::Exited)
    );

    let report = cell();
    let report_out = report.clone();
    let wait_thread = waiter.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let result = syscall::sys_wait_for_child(
            &wait_thread,
            &mut trap_frame,
            child_pid,
            WaitFlags::EXITED_CHILDREN,
        )
        .await;
        *report_out.lock() = Some(result);
    });
    ex.run_until_idle();

    let event = report.lock().take().expect("wait ran").expect("child reaped");
    assert_eq!(event.pid, child_pid);
    assert_eq!(event.reason, ChildSignalReason::Exited);
    assert_eq!(event.exit_value, 42);
    assert_eq!(event.resource_usage.user_time, 40);

    // Usage folded into the parent, child unlinked everywhere.
    assert_eq!(parent.child_resource_usage.lock().user_time, 40);
    assert_eq!(parent.child_resource_usage.lock().page_faults, 11);
    assert!(kernel.get_process_by_id(child_pid).is_none());
    assert!(parent.children().is_empty());

    // Nothing left to wait for.
    let empty = cell();
    let empty_out = empty.clone();
    let wait_thread = waiter.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let result = syscall::sys_wait_for_child(
            &wait_thread,
            &mut trap_frame,
            -1,
            WaitFlags::EXITED_CHILDREN | WaitFlags::RETURN_IMMEDIATELY,
        )
        .await;
        *empty_out.lock() = Some(result);
    });
    ex.run_until_idle();
    assert_eq!(
        empty.lock().take().expect("wait ran"),
        Err(SysError::Failed(Error::NoEligibleChildren))
    );
}

#[test]
fn broadcast_send_is_sticky_on_permission_failure() {
    let kernel = Kernel::new();
    let (_s, sender) = block_on(user_process(
        &kernel,
        "sender",
        Identity::user(1000),
        SignalSet::empty(),
    ));

    let friendly_a = kernel.create_process("a", Identity::user(1000), None);
    let _ta = block_on(kernel.create_thread(&friendly_a, "a"));
    let hostile = kernel.create_process("b", Identity::user(2000), None);
    let _tb = block_on(kernel.create_thread(&hostile, "b"));
    let friendly_c = kernel.create_process("c", Identity::user(1000), None);
    let _tc = block_on(kernel.create_thread(&friendly_c, "c"));

    let request = SendSignal {
        target_type: SignalTarget::AllProcesses,
        target_id: 0,
        signal_number: Signo::Rt40.to_primitive(),
        signal_code: -2,
        signal_parameter: 7,
    };
    let result = block_on(syscall::sys_send_signal(&kernel, &sender, &request));
    assert_eq!(result, Err(Error::PermissionDenied));

    // The permitted targets each still got their own entry.
    for proc in [&friendly_a, &friendly_c] {
        let sig = block_on(proc.queued().lock());
        assert_eq!(sig.queue.len(), 1);
        let params = sig.queue[0].params();
        assert_eq!(params.number, Some(Signo::Rt40));
        assert_eq!(params.parameter, 7);
        drop(sig);
    }
    let sig = block_on(hostile.queued().lock());
    assert!(sig.queue.is_empty());
    drop(sig);

    // A kernel-origin broadcast skips the permission checks and reaches
    // everything.
    let reached = block_on(signal::signal_all_processes(
        &kernel,
        None,
        Signo::Rt41,
        Some(SignalParameters::new(Signo::Rt41)),
    ))
    .expect("kernel broadcast");
    assert_eq!(reached, 4);
    let sig = block_on(hostile.queued().lock());
    assert_eq!(sig.queue.len(), 1);
    drop(sig);
}

#[test]
fn suspend_execution_clear_mode_round_trip() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Application1);
    let (_p, thread) = block_on(user_process(&kernel, "app", Identity::user(2), handled));

    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Blocked,
        SignalMaskOperation::Set,
        handled,
    ));

    let outcome = cell();
    let outcome_out = outcome.clone();
    let ex = exec();
    let suspender = thread.clone();
    let suspend_kernel = kernel.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let mut parameters = None;
        let status = syscall::sys_suspend_execution(
            &suspend_kernel,
            &suspender,
            &mut trap_frame,
            SignalMaskOperation::Clear,
            SignalSet::mask(Signo::Application1),
            SuspendTimeout::Indefinite,
            &mut parameters,
        )
        .await;
        *outcome_out.lock() = Some((status, parameters, trap_frame));
    });
    ex.run_until_idle();
    assert!(outcome.lock().is_none());

    block_on(signal::signal_thread(&thread, Signo::Application1, None, false));
    ex.run_until_idle();

    let (status, parameters, trap_frame) = outcome.lock().take().expect("suspend finished");
    // Reported but not applied; the wake consumed it.
    assert_eq!(status, Err(SysError::Failed(Error::Interrupted)));
    assert_eq!(parameters.map(|p| p.number), Some(Some(Signo::Application1)));
    assert_eq!(trap_frame.instruction_pointer, 0);

    // Re-posted: once unblocked, a later dispatch takes it.
    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Blocked,
        SignalMaskOperation::Clear,
        handled,
    ));
    let mut trap_frame = TrapFrame::default();
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Application1)
    );
}

#[test]
fn suspend_execution_timeout_is_not_reset_by_wakeups() {
    let kernel = Kernel::new();
    let (_p, thread) = block_on(user_process(
        &kernel,
        "app",
        Identity::user(2),
        SignalSet::empty(),
    ));

    let outcome = cell();
    let outcome_out = outcome.clone();
    let ex = exec();
    let suspender = thread.clone();
    let clock_kernel = kernel.clone();
    ex.spawn(async move {
        let mut trap_frame = TrapFrame::default();
        let mut parameters = None;
        let status = syscall::sys_suspend_execution(
            &clock_kernel,
            &suspender,
            &mut trap_frame,
            SignalMaskOperation::None,
            SignalSet::empty(),
            SuspendTimeout::Milliseconds(10),
            &mut parameters,
        )
        .await;
        *outcome_out.lock() = Some(status);
    });
    ex.run_until_idle();

    let tick = crate::time::Clock::ticks_per_millisecond();

    // A spurious wake at 4ms finds nothing; the original deadline stands.
    kernel.clock.advance(4 * tick);
    thread.wake(false);
    ex.run_until_idle();
    assert!(outcome.lock().is_none());

    kernel.clock.advance(5 * tick);
    ex.run_until_idle();
    assert!(outcome.lock().is_none());

    kernel.clock.advance(tick);
    ex.run_until_idle();
    assert_eq!(
        outcome.lock().take().expect("suspend finished"),
        Err(SysError::Failed(Error::Timeout))
    );
}

#[test]
fn behavior_masks_strip_control_signals() {
    let kernel = Kernel::new();
    let (proc, thread) = block_on(user_process(
        &kernel,
        "app",
        Identity::user(2),
        SignalSet::empty(),
    ));

    let poisoned = SignalSet::mask(Signo::Stop)
        .union(SignalSet::mask(Signo::Kill))
        .union(SignalSet::mask(Signo::Continue))
        .union(SignalSet::mask(Signo::Application1));
    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Blocked,
        SignalMaskOperation::Set,
        poisoned,
    ));
    {
        let sig = block_on(proc.queued().lock());
        assert_eq!(
            unsafe { thread.sig.assume_locked() }.blocked,
            SignalSet::mask(Signo::Application1)
        );
        drop(sig);
    }

    // Overwrite twice: the last overwrite wins outright.
    let first = SignalSet::mask(Signo::Application1).union(SignalSet::mask(Signo::Timer));
    let second = SignalSet::mask(Signo::BrokenPipe);
    block_on(syscall::set_signal_mask(&thread, first));
    block_on(syscall::set_signal_mask(&thread, second));
    {
        let sig = block_on(proc.queued().lock());
        assert_eq!(unsafe { thread.sig.assume_locked() }.blocked, second);
        drop(sig);
    }

    // Marking handled clears ignored.
    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Ignored,
        SignalMaskOperation::Set,
        SignalSet::mask(Signo::ChildProcessActivity),
    ));
    block_on(syscall::sys_set_signal_behavior(
        &thread,
        SignalMaskType::Handled,
        SignalMaskOperation::Set,
        SignalSet::mask(Signo::ChildProcessActivity),
    ));
    let sig = block_on(proc.queued().lock());
    assert!(!sig.ignored.contains(Signo::ChildProcessActivity));
    assert!(sig.handled.contains(Signo::ChildProcessActivity));
    drop(sig);
}

#[test]
fn pending_state_restored_while_work_remains() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Application1).union(SignalSet::mask(Signo::Application2));
    let (_p, thread) = block_on(user_process(&kernel, "app", Identity::user(2), handled));

    block_on(signal::signal_thread(&thread, Signo::Application1, None, false));
    block_on(signal::signal_thread(&thread, Signo::Application2, None, false));

    let mut trap_frame = TrapFrame::default();
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Application1)
    );
    // One signal remains; the consumer restored the pending state before
    // unlocking so it cannot sleep through it.
    assert_eq!(thread.signal_pending_state(), SignalPendingState::Any);

    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Application2)
    );
    assert_eq!(thread.signal_pending_state(), SignalPendingState::None);
}

#[test]
fn cancellation_completes_once_and_reports_too_late() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Rt45);
    let (proc, thread) = block_on(user_process(&kernel, "app", Identity::user(2), handled));

    let completions = Arc::new(core::sync::atomic::AtomicUsize::new(0));
    let counter = completions.clone();
    let entry = SignalQueueEntry::new(
        SignalParameters {
            number: Some(Signo::Rt45),
            code: -1,
            sending_process: proc.id(),
            sending_user: 2,
            parameter: 0,
        },
        Completion::Callback(alloc::boxed::Box::new(move |_| {
            counter.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        })),
    );

    block_on(signal::signal_process(&proc, Signo::Rt45, Some(entry.clone())));
    assert!(entry.is_linked());

    assert!(block_on(signal::cancel_queued_signal(&proc, &entry)).is_ok());
    assert_eq!(completions.load(core::sync::atomic::Ordering::Relaxed), 1);

    // Already detached: too late, and the completion does not run again.
    assert_eq!(
        block_on(signal::cancel_queued_signal(&proc, &entry)),
        Err(Error::TooLate)
    );
    assert_eq!(completions.load(core::sync::atomic::Ordering::Relaxed), 1);

    // An entry pulled by delivery is too late as well.
    let delivered = SignalQueueEntry::new(
        SignalParameters {
            number: Some(Signo::Rt45),
            code: -1,
            sending_process: proc.id(),
            sending_user: 2,
            parameter: 0,
        },
        Completion::Release,
    );
    block_on(signal::signal_process(&proc, Signo::Rt45, Some(delivered.clone())));
    let mut trap_frame = TrapFrame::default();
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Rt45)
    );
    assert_eq!(
        block_on(signal::cancel_queued_signal(&proc, &delivered)),
        Err(Error::TooLate)
    );
}

#[test]
fn child_signal_entry_rebinds_to_one_destination() {
    let kernel = Kernel::new();
    let (_p, waiter) = block_on(user_process(
        &kernel,
        "parent",
        Identity::user(4),
        SignalSet::empty(),
    ));
    let parent = waiter.proc().clone();
    let child = kernel.create_process("child", Identity::user(4), Some(&parent));
    let _child_thread = block_on(kernel.create_thread(&child, "child"));

    block_on(signal::queue_child_signal_to_parent(
        &child,
        Signo::Stop.to_primitive() as usize,
        ChildSignalReason::Stopped,
    ));
    let entry = child.child_signal_entry().clone();
    assert!(entry.is_linked());

    // A new transition rebinds the same entry; it is never on two queues.
    block_on(signal::queue_child_signal_to_parent(
        &child,
        Signo::Continue.to_primitive() as usize,
        ChildSignalReason::Continued,
    ));
    assert!(entry.is_linked());
    let sig = block_on(parent.queued().lock());
    let linked_count = sig
        .queue
        .iter()
        .chain(sig.blocked_queue.iter())
        .filter(|e| Arc::ptr_eq(e, &entry))
        .count();
    assert_eq!(linked_count, 1);
    drop(sig);
    assert_eq!(
        entry.params().code,
        ChildSignalReason::Continued.to_primitive() as i16
    );
}

#[test]
fn default_actions_terminate_dump_and_stop() {
    let kernel = Kernel::new();

    // Unhandled termination-class signal kills the process.
    let (proc, thread) = block_on(user_process(
        &kernel,
        "doomed",
        Identity::user(2),
        SignalSet::empty(),
    ));
    let ex = exec();
    let id = spawn_user_loop(&ex, thread.clone());
    block_on(signal::signal_process(&proc, Signo::RequestTermination, None));
    ex.run_until_idle();
    assert!(ex.is_done(id));
    assert!(thread.is_exited());
    assert_eq!(proc.exit_status().reason, Some(ChildSignalReason::Killed));
    assert_eq!(
        proc.exit_status().status,
        Signo::RequestTermination.to_primitive() as usize
    );

    // Unhandled abort-class signal dumps.
    let (proc, thread) = block_on(user_process(
        &kernel,
        "aborter",
        Identity::user(2),
        SignalSet::empty(),
    ));
    let id = spawn_user_loop(&ex, thread.clone());
    block_on(signal::signal_process(&proc, Signo::Abort, None));
    ex.run_until_idle();
    assert!(ex.is_done(id));
    assert_eq!(proc.exit_status().reason, Some(ChildSignalReason::Dumped));

    // Unhandled stop-request stops the process.
    let (proc, thread) = block_on(user_process(
        &kernel,
        "stopper",
        Identity::user(2),
        SignalSet::empty(),
    ));
    let id = spawn_user_loop(&ex, thread.clone());
    block_on(signal::signal_process(&proc, Signo::RequestStop, None));
    ex.run_until_idle();
    assert!(!ex.is_done(id));
    assert_eq!(
        proc.stopped_thread_count
            .load(core::sync::atomic::Ordering::Acquire),
        1
    );
    assert!(!proc.stop_event.is_signaled());

    // And a kill takes it down even while stopped; the dump/kill status
    // recorded first is sticky.
    block_on(signal::signal_process(&proc, Signo::Kill, None));
    ex.run_until_idle();
    assert!(ex.is_done(id));
    assert_eq!(proc.exit_status().reason, Some(ChildSignalReason::Killed));
}

#[test]
fn forced_send_of_running_signal_escalates_to_kill() {
    let kernel = Kernel::new();
    let handled = SignalSet::mask(Signo::Application1);
    let (proc, thread) = block_on(user_process(&kernel, "app", Identity::user(2), handled));

    block_on(signal::signal_thread(&thread, Signo::Application1, None, false));
    let mut trap_frame = TrapFrame::default();
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::Application1)
    );

    // The handler is still on the stack; a forced duplicate may not
    // recurse into it.
    block_on(signal::signal_thread(&thread, Signo::Application1, None, true));
    assert!(proc.pending.contains(Signo::Kill));
    assert_eq!(proc.exit_status().reason, Some(ChildSignalReason::Killed));
    assert_eq!(
        proc.exit_status().status,
        Signo::Application1.to_primitive() as usize
    );
}

#[test]
fn signal_zero_probes_existence_without_queuing() {
    let kernel = Kernel::new();
    let (_s, sender) = block_on(user_process(
        &kernel,
        "sender",
        Identity::user(1000),
        SignalSet::empty(),
    ));
    let target = kernel.create_process("target", Identity::user(1000), None);
    let target_thread = block_on(kernel.create_thread(&target, "t"));
    let stranger = kernel.create_process("stranger", Identity::user(2000), None);
    let _stranger_thread = block_on(kernel.create_thread(&stranger, "t"));

    let probe = |pid| SendSignal {
        target_type: SignalTarget::Process,
        target_id: pid,
        signal_number: 0,
        signal_code: 0,
        signal_parameter: 0,
    };
    assert!(block_on(syscall::sys_send_signal(&kernel, &sender, &probe(target.id()))).is_ok());
    assert_eq!(
        block_on(syscall::sys_send_signal(&kernel, &sender, &probe(stranger.id()))),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        block_on(syscall::sys_send_signal(&kernel, &sender, &probe(99999))),
        Err(Error::NoSuchProcess)
    );

    assert!(target.pending.load().is_empty());
    assert_eq!(target_thread.signal_pending_state(), SignalPendingState::Unknown);
}

#[test]
fn unhandled_fault_reports_to_kernel_debugger_then_dumps() {
    let kernel = Kernel::new();
    kernel.kd.set_connected(true);
    kernel.kd.set_user_exceptions_enabled(true);

    let (proc, thread) = block_on(user_process(
        &kernel,
        "app",
        Identity::user(2),
        SignalSet::empty(),
    ));

    block_on(signal::signal_thread(&thread, Signo::AccessViolation, None, false));
    let mut trap_frame = TrapFrame::default();
    // The fault is reported on the way through, and with no handler the
    // default action dumps the process.
    assert_eq!(
        block_on(signal::dispatch_pending_signals(&thread, &mut trap_frame)),
        DispatchResult::Delivered(Signo::AccessViolation)
    );
    assert_eq!(proc.exit_status().reason, Some(ChildSignalReason::Dumped));
    assert!(proc.pending.contains(Signo::Kill));
}
