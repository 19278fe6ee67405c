//! Futexes
//!
//! Compare-and-sleep on a 32-bit word, keyed by its address. All futex
//! sleepers share one priority-ordered wait list; the address lives in the
//! thread's wait payload. A waker clears that payload, which is how the
//! sleeper tells a wake from a timeout.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicU32, Ordering};

use log::trace;

use crate::critical::IrqMasked;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelState};
use crate::multiwait::Notification;
use crate::platform::Platform;
use crate::thread::{WaitPayload, WakeReason};
use crate::timer::Timeout;

/// Key a futex word by address
pub(crate) fn word_key(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

impl<C: Copy> KernelState<C> {
    /// Wake up to `count` sleepers on `key`, threads before multiwaiters
    ///
    /// Returns whether the caller should yield and how many woke.
    pub(crate) fn futex_wake(&mut self, cs: IrqMasked, key: usize, count: u32) -> (bool, u32) {
        let mut should_yield = false;
        let mut woken = 0u32;

        let waiters = self.sched.waiters(self.futex_waiters);
        for &idx in waiters.as_slice() {
            if woken == count {
                break;
            }
            let thread = self.sched.thread_at_mut(idx);
            if thread.payload != (WaitPayload::Futex { address: key }) {
                continue;
            }
            thread.payload = WaitPayload::None;
            should_yield |= self.sched.ready_index(cs, idx, WakeReason::Futex);
            woken += 1;
        }

        if woken < count {
            let (more, yield_mw) = self.multiwaiter_notify(cs, Notification::Futex(key), count - woken);
            woken += more;
            should_yield |= yield_mw;
        }
        (should_yield, woken)
    }
}

impl<P: Platform> Kernel<P> {
    /// Sleep while `*word == expected`
    ///
    /// Returns at once if the value already differs. A non-blocking timeout
    /// with a matching value is `TimedOut`. Fails with `InvalidArgument` if
    /// the word's memory is (or becomes, while asleep) invalid.
    pub fn futex_wait(&self, timeout: &mut Timeout, word: &AtomicU32, expected: u32) -> Result<()> {
        let key = word_key(word);
        if !self.platform().is_live(key) {
            return Err(Error::InvalidArgument);
        }

        let mut cs = self.lock();
        if word.load(Ordering::Acquire) != expected {
            return Ok(());
        }
        if !timeout.may_block() {
            return Err(Error::TimedOut);
        }
        self.exceptions().assert_safe_to_block();

        trace!("futex wait on {:#x} for {:?}", key, cs.sched.current());
        cs.sched.set_current_payload(WaitPayload::Futex { address: key });
        let list = cs.futex_waiters;
        let (mut cs, _) = self.suspend_current(cs, timeout, Some(list), false, false);
        let payload = cs.sched.take_current_payload();
        drop(cs);

        if !self.platform().is_live(key) {
            return Err(Error::InvalidArgument);
        }
        match payload {
            WaitPayload::None => Ok(()),
            _ => Err(Error::TimedOut),
        }
    }

    /// Wake up to `count` sleepers on `word`
    ///
    /// `u32::MAX` wakes everyone. Returns the number woken, counting
    /// multiwaiters.
    pub fn futex_wake(&self, word: &AtomicU32, count: u32) -> Result<u32> {
        let key = word_key(word);
        if !self.platform().is_live(key) {
            return Err(Error::InvalidArgument);
        }

        let mut cs = self.lock();
        let token = cs.token();
        let (should_yield, woken) = cs.futex_wake(token, key, count);
        drop(cs);

        trace!("futex wake on {:#x}: {} woken", key, woken);
        self.yield_if(should_yield);
        Ok(woken)
    }
}
