//! sched-core — Concurrency Core for a Single-Core Embedded Kernel
//!
//! Block on words, not on objects.
//!
//! Scheduler and blocking primitives for a compartmentalised microkernel:
//! - 32-level fixed-priority scheduler with O(1) pick and round-robin peers
//! - Tick timer with sorted expiry list and early-wake sleeps
//! - Futexes keyed by address, checked for liveness before and after sleep
//! - Message queues and counting semaphores over fixed-size slots
//! - 24-bit event groups with wait-any / wait-all / clear-on-exit
//! - Multiwaiters blocking one thread on futexes, queues and events at once
//!
//! The hardware side (trap entry, context switch, timer, interrupt mask)
//! is supplied through [`Platform`]; `feature = "std"` adds a host
//! simulator that runs kernel threads as OS threads.
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
mod list;
pub mod thread;
pub mod scheduler;
pub mod timer;
pub mod critical;
pub mod platform;
pub mod handle;
mod ring;
pub mod kernel;
pub mod futex;
pub mod queue;
pub mod event;
pub mod multiwait;
#[cfg(any(test, feature = "std"))]
pub mod sim;

pub use error::{Error, Result};
pub use thread::{Priority, ThreadId, ThreadState, WakeReason};
pub use scheduler::{Scheduler, WaitListId};
pub use timer::Timeout;
pub use critical::IrqMasked;
pub use platform::Platform;
pub use handle::Handle;
pub use kernel::{Kernel, SleepFlags, Trap};
pub use queue::QueueHandle;
pub use event::{EventHandle, EventWaitFlags};
pub use multiwait::{MultiWaiterHandle, QueueReady, WaitDescriptor, WaitSource, SOURCE_GONE};
