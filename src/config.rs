//! Kernel configuration
//!
//! Compile-time limits. Every table in the kernel is sized from these,
//! so the scheduler never allocates after boot.
//!
//! Author: Moroya Sakamoto

/// Maximum threads the kernel can manage
pub const MAX_THREADS: usize = 16;

/// Number of priority levels (0 = lowest, 31 = highest)
///
/// Bounded by the width of the ready-queue occupancy bitmap.
pub const PRIORITY_LEVELS: usize = 32;

/// Maximum live message queues (including semaphores)
pub const MAX_QUEUES: usize = 16;

/// Maximum live event groups
pub const MAX_EVENT_GROUPS: usize = 16;

/// Maximum live multiwaiters
pub const MAX_MULTIWAITERS: usize = 8;

/// Maximum event sources a single multiwaiter may watch
pub const MULTIWAITER_MAX_SOURCES: usize = 8;

/// Wait lists available to raw `thread_suspend` callers
pub const SPARE_WAIT_LISTS: usize = 4;

/// Total wait-list heads: futex list, multiwaiter list, two per queue,
/// one per event group, plus the spares.
pub const MAX_WAIT_LISTS: usize =
    2 + 2 * MAX_QUEUES + MAX_EVENT_GROUPS + SPARE_WAIT_LISTS;

/// Event groups carry 24 usable flag bits
pub const EVENT_BITS_MASK: u32 = 0x00ff_ffff;

/// Largest backing buffer a single queue may request
pub const QUEUE_MAX_BYTES: usize = 64 * 1024;

const _: () = assert!(PRIORITY_LEVELS <= u32::BITS as usize);
const _: () = assert!(MAX_THREADS < u8::MAX as usize);
const _: () = assert!(MAX_WAIT_LISTS <= u8::MAX as usize);
