//! Tick timer and timeouts
//!
//! The hardware timer drives `tick()`, which advances the monotonic tick
//! counter and readies every suspended thread whose expiry has passed. The
//! timer list is sorted, so expiry stops at the first thread still due in
//! the future.
//!
//! Author: Moroya Sakamoto

use log::trace;

use crate::critical::IrqMasked;
use crate::scheduler::Scheduler;
use crate::thread::WakeReason;

/// Expiry of a thread that never times out
pub const UNBOUNDED_EXPIRY: u64 = u64::MAX;

/// Absolute expiry for a relative wait
pub(crate) fn expiry_after(now: u64, wait_ticks: u32) -> u64 {
    if wait_ticks == Timeout::UNLIMITED {
        UNBOUNDED_EXPIRY
    } else {
        now.saturating_add(wait_ticks as u64)
    }
}

/// Caller-owned timeout, updated across blocking calls
///
/// `remaining == 0` means try once, `remaining == Timeout::UNLIMITED` means
/// wait forever. A caller can pass the same `Timeout` to several blocking
/// calls to share one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Ticks spent blocked so far
    pub elapsed: u32,
    /// Ticks still allowed
    pub remaining: u32,
}

impl Timeout {
    /// Sentinel for "block forever"
    pub const UNLIMITED: u32 = u32::MAX;

    /// Block for at most `ticks`
    pub const fn new(ticks: u32) -> Self {
        Self {
            elapsed: 0,
            remaining: ticks,
        }
    }

    /// Block forever
    pub const fn unlimited() -> Self {
        Self::new(Self::UNLIMITED)
    }

    /// Never block
    pub const fn non_blocking() -> Self {
        Self::new(0)
    }

    pub const fn may_block(&self) -> bool {
        self.remaining > 0
    }

    pub const fn is_unlimited(&self) -> bool {
        self.remaining == Self::UNLIMITED
    }

    /// Charge `ticks` of blocking against this timeout
    pub fn elapse(&mut self, ticks: u32) {
        if !self.is_unlimited() {
            self.remaining = self.remaining.saturating_sub(ticks);
        }
        self.elapsed = self.elapsed.saturating_add(ticks);
    }
}

impl<C: Copy> Scheduler<C> {
    /// Timer interrupt: advance time and wake expired threads
    pub fn tick(&mut self, cs: IrqMasked) {
        self.ticks += 1;
        self.expire_timers(cs);
    }

    /// Ready every thread whose expiry is due
    ///
    /// If that leaves nothing runnable, a sleeper at the head of the timer
    /// list that asked for early wake is readied as well.
    pub fn expire_timers(&mut self, cs: IrqMasked) {
        let now = self.ticks;
        while let Some(head) = self.timer_list {
            if self.thread_at(head).expiry > now {
                break;
            }
            trace!("thread {} timed out at tick {}", head + 1, now);
            self.ready_index(cs, head, WakeReason::Timer);
        }

        if !self.any_ready() {
            if let Some(head) = self.timer_list {
                if self.thread_at(head).yielding {
                    trace!("thread {} woken early, nothing else runnable", head + 1);
                    self.ready_index(cs, head, WakeReason::Timer);
                }
            }
        }
    }

    /// Deadline for the next timer interrupt
    ///
    /// The nearer of the first expiry and one tick from now (when the
    /// running thread has equal-priority peers to time-slice with). `None`
    /// means no interrupt is needed.
    pub fn next_interrupt(&self) -> Option<u64> {
        let next_expiry = match self.timer_list {
            Some(head) => self.thread_at(head).expiry,
            None => UNBOUNDED_EXPIRY,
        };
        let next_slice = if self.has_priority_peers() {
            self.ticks + 1
        } else {
            UNBOUNDED_EXPIRY
        };
        let deadline = next_expiry.min(next_slice);
        if deadline == UNBOUNDED_EXPIRY {
            None
        } else {
            Some(deadline)
        }
    }

    /// Ticks since boot
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, ThreadId};

    fn cs() -> IrqMasked {
        unsafe { IrqMasked::new_unchecked() }
    }

    fn sleeping(timeouts: &[u32], yielding: bool) -> (Scheduler<u32>, [ThreadId; 4]) {
        let mut sched = Scheduler::new();
        let mut ids = [ThreadId(0); 4];
        for (i, _) in timeouts.iter().enumerate() {
            ids[i] = sched.create(cs(), i as u32, Priority(4)).unwrap();
            sched.ready(cs(), ids[i], WakeReason::Timer);
        }
        sched.schedule(cs(), 99);
        for t in timeouts {
            let cur = sched.current().unwrap();
            sched.suspend(cs(), cur, *t, None, yielding);
            sched.schedule(cs(), 0);
        }
        (sched, ids)
    }

    #[test]
    fn test_timeout_sentinels() {
        assert!(!Timeout::non_blocking().may_block());
        assert!(Timeout::new(5).may_block());
        assert!(Timeout::unlimited().is_unlimited());
    }

    #[test]
    fn test_elapse() {
        let mut t = Timeout::new(10);
        t.elapse(4);
        assert_eq!(t, Timeout { elapsed: 4, remaining: 6 });
        t.elapse(9);
        assert_eq!(t, Timeout { elapsed: 13, remaining: 0 });
        assert!(!t.may_block());

        let mut forever = Timeout::unlimited();
        forever.elapse(1000);
        assert!(forever.is_unlimited());
        assert_eq!(forever.elapsed, 1000);
    }

    #[test]
    fn test_expiry_after() {
        assert_eq!(expiry_after(10, 5), 15);
        assert_eq!(expiry_after(10, Timeout::UNLIMITED), UNBOUNDED_EXPIRY);
    }

    #[test]
    fn test_tick_wakes_in_expiry_order() {
        let (mut sched, ids) = sleeping(&[3, 1, 2], false);
        assert!(!sched.any_ready());

        sched.tick(cs());
        assert!(sched.thread(ids[1]).unwrap().is_ready());
        assert!(sched.thread(ids[2]).unwrap().is_suspended());

        sched.tick(cs());
        assert!(sched.thread(ids[2]).unwrap().is_ready());
        assert!(sched.thread(ids[0]).unwrap().is_suspended());

        sched.tick(cs());
        assert!(sched.thread(ids[0]).unwrap().is_ready());
        assert_eq!(sched.thread(ids[0]).unwrap().last_wake(), Some(WakeReason::Timer));
        assert_eq!(sched.ticks(), 3);
    }

    #[test]
    fn test_unbounded_sleepers_never_expire() {
        let (mut sched, ids) = sleeping(&[Timeout::UNLIMITED], false);
        for _ in 0..100 {
            sched.tick(cs());
        }
        assert!(sched.thread(ids[0]).unwrap().is_suspended());
        assert_eq!(sched.next_interrupt(), None);
    }

    #[test]
    fn test_early_wake_when_idle() {
        let (mut sched, ids) = sleeping(&[50], true);
        sched.expire_timers(cs());
        assert!(sched.thread(ids[0]).unwrap().is_ready());
        assert_eq!(sched.ticks(), 0);
    }

    #[test]
    fn test_next_interrupt_is_first_expiry() {
        let (sched, _) = sleeping(&[7, 4], false);
        assert_eq!(sched.next_interrupt(), Some(4));
    }

    #[test]
    fn test_next_interrupt_time_slices_peers() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        for i in 0..2 {
            let id = sched.create(cs(), i, Priority(3)).unwrap();
            sched.ready(cs(), id, WakeReason::Timer);
        }
        sched.schedule(cs(), 0);
        assert!(sched.has_priority_peers());
        assert_eq!(sched.next_interrupt(), Some(1));
    }
}
