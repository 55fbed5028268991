//! Signal delivery for a preemptive multi-threaded kernel.
//!
//! The subsystem queues asynchronous notifications to threads and
//! processes, applies blocking/ignoring/handling policy on the way out,
//! coordinates the process-wide stop/continue barrier, reports child
//! activity to parents through the reusable child-signal entry, and lets an
//! attached tracer interpose on signals in flight.
//!
//! Kernel threads are cooperative futures: every suspension point (stop
//! event, all-stopped event, timed or indefinite suspends, wait-for-child)
//! is an `await`, driven by an [`executor`] task.

#![no_std]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod arch;
pub mod config;
pub mod kd;
pub mod proc;
pub mod sleeplock;
pub mod spinlock;
pub mod syscall;
pub mod time;

pub use proc::{Kernel, Proc, Thread};
