//! Compile-time tunables.

/// Ticks per second of the monotonic time counter.
pub const TIME_COUNTER_FREQUENCY: u64 = 1_000_000;

/// Capacity of an executor wake queue.
pub const TASK_QUEUE_SIZE: usize = 1024;

/// Identifier reserved for the kernel process.
pub const KERNEL_PROCESS_ID: i32 = 0;
