//! Interrupt masking and exception nesting
//!
//! The scheduler's only form of exclusion is running with interrupts
//! masked on a single core. [`IrqMasked`] is the proof of that, handed to
//! every mutating scheduler call. [`Critical`] produces it: mask, take the
//! state lock, restore on drop.
//!
//! Author: Moroya Sakamoto

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::MutexGuard;

use crate::platform::Platform;

/// Capability token: interrupts are masked and the caller is the only writer
#[derive(Debug, Clone, Copy)]
pub struct IrqMasked {
    _private: (),
}

impl IrqMasked {
    /// Mint a token without masking anything
    ///
    /// # Safety
    /// The caller must already run with interrupts masked (for example in a
    /// trap handler) and must be the sole user of the scheduler it passes
    /// the token to.
    pub const unsafe fn new_unchecked() -> Self {
        Self { _private: () }
    }
}

/// Interrupts masked and kernel state locked
///
/// Masking is the exclusion. The lock is taken only after interrupts are
/// off on the one core, so it is never contended; it exists to make the
/// kernel state `Sync` and is not a second exclusion mechanism.
///
/// Dropping releases the lock first, then restores the interrupt state.
pub(crate) struct Critical<'k, T, P: Platform> {
    guard: Option<MutexGuard<'k, T>>,
    platform: &'k P,
    was_enabled: bool,
}

impl<'k, T, P: Platform> Critical<'k, T, P> {
    pub(crate) fn enter(state: &'k spin::Mutex<T>, platform: &'k P) -> Self {
        let was_enabled = platform.interrupts_disable();
        Self {
            guard: Some(state.lock()),
            platform,
            was_enabled,
        }
    }

    /// Token for scheduler calls made under this section
    pub(crate) fn token(&self) -> IrqMasked {
        IrqMasked { _private: () }
    }
}

impl<T, P: Platform> Deref for Critical<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("critical section used after release"),
        }
    }
}

impl<T, P: Platform> DerefMut for Critical<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("critical section used after release"),
        }
    }
}

impl<T, P: Platform> Drop for Critical<'_, T, P> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.platform.interrupts_restore(self.was_enabled);
    }
}

/// Exception nesting depth
pub(crate) struct ExceptionLevel(AtomicU8);

impl ExceptionLevel {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Enter a trap handler; nested traps are fatal
    pub(crate) fn enter(&self) -> ExceptionGuard<'_> {
        let previous = self.0.fetch_add(1, Ordering::AcqRel);
        assert!(previous == 0, "nested exception (depth {})", previous + 1);
        ExceptionGuard { level: self }
    }

    pub(crate) fn depth(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Blocking from a trap handler has no context to come back to
    pub(crate) fn assert_safe_to_block(&self) {
        assert!(self.depth() == 0, "Trying to block in an interrupt context.");
    }
}

/// Live while a trap handler runs
pub(crate) struct ExceptionGuard<'a> {
    level: &'a ExceptionLevel,
}

impl Drop for ExceptionGuard<'_> {
    fn drop(&mut self) {
        self.level.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn test_critical_masks_before_locking_and_restores() {
        let platform = SimPlatform::new();
        let state = spin::Mutex::new(7u32);
        {
            let mut cs = Critical::enter(&state, &platform);
            assert!(!platform.interrupts_enabled());
            assert!(state.is_locked());
            *cs += 1;
        }
        assert!(platform.interrupts_enabled());
        assert!(!state.is_locked());
        assert_eq!(*state.lock(), 8);
    }

    #[test]
    fn test_exception_guard_tracks_depth() {
        let level = ExceptionLevel::new();
        assert_eq!(level.depth(), 0);
        {
            let _guard = level.enter();
            assert_eq!(level.depth(), 1);
        }
        assert_eq!(level.depth(), 0);
        level.assert_safe_to_block();
    }

    #[test]
    #[should_panic(expected = "nested exception")]
    fn test_nested_exception_panics() {
        let level = ExceptionLevel::new();
        let _outer = level.enter();
        let _inner = level.enter();
    }

    #[test]
    #[should_panic(expected = "interrupt context")]
    fn test_block_inside_exception_panics() {
        let level = ExceptionLevel::new();
        let _guard = level.enter();
        level.assert_safe_to_block();
    }
}
