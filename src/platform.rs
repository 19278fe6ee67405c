//! Platform collaborators
//!
//! Everything the scheduler core needs from outside: interrupt masking,
//! the context switch, the tick timer and the liveness predicate for memory
//! handed in by untrusted callers. On hardware this is the trap/switcher
//! layer; on a host it is [`crate::sim::SimPlatform`].
//!
//! Author: Moroya Sakamoto

use core::fmt::Debug;

use crate::kernel::Kernel;

/// Hardware and switcher services used by the kernel
pub trait Platform: Sized {
    /// Opaque saved-context handle the switcher resumes
    type Context: Copy + Eq + Debug;

    /// Mask interrupts, returning whether they were enabled
    fn interrupts_disable(&self) -> bool;

    /// Restore the state returned by `interrupts_disable`
    fn interrupts_restore(&self, was_enabled: bool);

    /// Trap into the switcher
    ///
    /// The switcher calls [`Kernel::exception_entry`] with
    /// [`crate::kernel::Trap::Yield`], resumes whichever context that
    /// returns, and comes back here once the calling thread is picked again.
    /// Called with interrupts enabled and no kernel lock held.
    fn yield_now(&self, kernel: &Kernel<Self>);

    /// Program the next timer interrupt (absolute ticks), or stop it
    fn timer_set(&self, deadline: Option<u64>);

    /// Is the memory at `address` still valid to touch?
    fn is_live(&self, address: usize) -> bool;
}
