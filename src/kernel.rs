//! Kernel facade
//!
//! Owns the scheduler, every synchronisation object and the platform
//! collaborator. All state sits behind one interrupt-masked critical
//! section; blocking calls suspend the running thread, leave the section
//! and trap into the switcher, then re-enter and re-validate once they are
//! scheduled again.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, info};

use crate::config::{MAX_EVENT_GROUPS, MAX_MULTIWAITERS, MAX_QUEUES};
use crate::critical::{Critical, ExceptionLevel, IrqMasked};
use crate::error::{Error, Result};
use crate::event::EventGroup;
use crate::futex::word_key;
use crate::handle::Slab;
use crate::multiwait::MultiWaiter;
use crate::platform::Platform;
use crate::queue::Queue;
use crate::scheduler::{Scheduler, WaitListId};
use crate::thread::{Priority, ThreadId, WakeReason};
use crate::timer::Timeout;

/// Why the switcher entered the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// A thread gave up the processor
    Yield,
    /// Timer interrupt
    Timer,
    /// The running thread returned from its entry point
    ThreadExit,
}

bitflags! {
    /// Options for `thread_sleep`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u32 {
        /// Sleep the full duration even if nothing else wants to run
        const NO_EARLY_WAKE = 1 << 0;
    }
}

/// Everything guarded by the critical section
pub(crate) struct KernelState<C> {
    pub(crate) sched: Scheduler<C>,
    /// Every thread blocked in `futex_wait`, by priority
    pub(crate) futex_waiters: WaitListId,
    /// Every thread blocked in `multiwaiter_wait`, by priority
    pub(crate) multiwaiter_threads: WaitListId,
    pub(crate) queues: Slab<Queue, MAX_QUEUES>,
    pub(crate) events: Slab<EventGroup, MAX_EVENT_GROUPS>,
    pub(crate) multiwaiters: Slab<MultiWaiter, MAX_MULTIWAITERS>,
    /// Multiwaiters whose thread was readied but has not collected yet
    pub(crate) woken_multiwaiters: Option<u16>,
}

impl<C: Copy> KernelState<C> {
    fn new() -> Self {
        let mut sched = Scheduler::new();
        // SAFETY: the state is not shared yet.
        let cs = unsafe { IrqMasked::new_unchecked() };
        let (Some(futex_waiters), Some(multiwaiter_threads)) =
            (sched.wait_list_alloc(cs), sched.wait_list_alloc(cs))
        else {
            unreachable!("a fresh scheduler has free wait lists");
        };
        Self {
            sched,
            futex_waiters,
            multiwaiter_threads,
            queues: Slab::new(),
            events: Slab::new(),
            multiwaiters: Slab::new(),
            woken_multiwaiters: None,
        }
    }
}

/// Critical section over the kernel state of platform `P`
pub(crate) type Section<'k, P> = Critical<'k, KernelState<<P as Platform>::Context>, P>;

/// The kernel
pub struct Kernel<P: Platform> {
    platform: P,
    state: spin::Mutex<KernelState<P::Context>>,
    exceptions: ExceptionLevel,
}

impl<P: Platform> Kernel<P> {
    /// Create a kernel with no threads
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            state: spin::Mutex::new(KernelState::new()),
            exceptions: ExceptionLevel::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Mask interrupts and lock the kernel state
    pub(crate) fn lock(&self) -> Section<'_, P> {
        Critical::enter(&self.state, &self.platform)
    }

    pub(crate) fn exceptions(&self) -> &ExceptionLevel {
        &self.exceptions
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Register a thread and make it runnable
    ///
    /// `context` is what the switcher resumes when the thread is picked.
    pub fn thread_create(&self, context: P::Context, priority: Priority) -> Result<ThreadId> {
        let mut cs = self.lock();
        let token = cs.token();
        let id = cs.sched.create(token, context, priority)?;
        cs.sched.ready(token, id, WakeReason::Timer);
        debug!("thread {} created with priority {}", id.0, priority.0);
        Ok(id)
    }

    /// Wake a suspended thread as if its timeout expired
    ///
    /// Returns whether the caller should yield.
    pub fn thread_ready(&self, id: ThreadId) -> Result<bool> {
        let mut cs = self.lock();
        let token = cs.token();
        if cs.sched.thread(id).is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(cs.sched.ready(token, id, WakeReason::Timer))
    }

    /// Suspend the running thread, optionally on a wait list
    ///
    /// Returns true if the wait timed out. A wait list that was deleted is
    /// rejected with `InvalidArgument`.
    pub fn thread_suspend(
        &self,
        timeout: &mut Timeout,
        wait_list: Option<WaitListId>,
    ) -> Result<bool> {
        self.exceptions.assert_safe_to_block();
        let cs = self.lock();
        if let Some(wl) = wait_list {
            if !cs.sched.wait_list_in_use(wl) {
                return Err(Error::InvalidArgument);
            }
        }
        let (_cs, timed_out) = self.suspend_current(cs, timeout, wait_list, false, false);
        Ok(timed_out)
    }

    /// Pick the next thread without any trap bookkeeping
    pub fn thread_schedule(&self, interrupted: P::Context) -> P::Context {
        let mut cs = self.lock();
        let token = cs.token();
        cs.sched.schedule(token, interrupted)
    }

    /// Give up the processor to an equal-or-higher priority thread
    pub fn thread_yield(&self) {
        self.exceptions.assert_safe_to_block();
        self.platform.yield_now(self);
    }

    /// Sleep for up to `timeout` ticks
    ///
    /// Always yields. Unless `NO_EARLY_WAKE` is given, the sleeper may be
    /// woken before the timeout when no other thread is runnable.
    pub fn thread_sleep(&self, timeout: &mut Timeout, flags: SleepFlags) {
        self.exceptions.assert_safe_to_block();
        let cs = self.lock();
        let early_wake = !flags.contains(SleepFlags::NO_EARLY_WAKE);
        let _ = self.suspend_current(cs, timeout, None, true, early_wake);
    }

    /// Running thread
    pub fn thread_id_get(&self) -> Option<ThreadId> {
        self.lock().sched.current()
    }

    /// Threads ever created
    pub fn thread_count(&self) -> usize {
        self.lock().sched.thread_count()
    }

    /// Threads that have not exited
    pub fn live_threads(&self) -> usize {
        self.lock().sched.live_threads()
    }

    /// Ticks since boot
    pub fn ticks(&self) -> u64 {
        self.lock().sched.ticks()
    }

    /// Allocate a wait list for use with `thread_suspend`
    pub fn wait_list_create(&self) -> Result<WaitListId> {
        let mut cs = self.lock();
        let token = cs.token();
        cs.sched.wait_list_alloc(token).ok_or(Error::OutOfMemory)
    }

    /// Wake everything on `wait_list` with `Delete` and free it
    pub fn wait_list_delete(&self, wait_list: WaitListId) -> Result<()> {
        let mut cs = self.lock();
        let token = cs.token();
        if !cs.sched.wait_list_in_use(wait_list)
            || wait_list == cs.futex_waiters
            || wait_list == cs.multiwaiter_threads
        {
            return Err(Error::InvalidArgument);
        }
        let mut should_yield = false;
        while let Some(idx) = cs.sched.wait_list_head(wait_list) {
            should_yield |= cs.sched.ready_index(token, idx, WakeReason::Delete);
        }
        cs.sched.wait_list_free(token, wait_list);
        drop(cs);
        self.yield_if(should_yield);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Traps
    // ------------------------------------------------------------------

    /// Trap handler: run timers, pick the next thread, re-arm the timer
    ///
    /// Called by the switcher with the context it interrupted; returns the
    /// context to resume.
    pub fn exception_entry(&self, trap: Trap, interrupted: P::Context) -> P::Context {
        let _exception = self.exceptions.enter();
        let mut cs = self.lock();
        let token = cs.token();

        match trap {
            Trap::Timer => cs.sched.tick(token),
            Trap::Yield => {
                if cs.sched.current_is_ready() || !cs.sched.any_ready() {
                    cs.sched.expire_timers(token);
                }
            }
            Trap::ThreadExit => {
                if cs.sched.exit(token) {
                    info!("last thread exited at tick {}", cs.sched.ticks());
                }
                cs.sched.expire_timers(token);
            }
        }

        let next = cs.sched.schedule(token, interrupted);
        let deadline = cs.sched.next_interrupt();
        drop(cs);
        self.platform.timer_set(deadline);
        next
    }

    /// External interrupt bound to a futex word
    ///
    /// Bumps the word and wakes everything waiting on it; reschedules if
    /// anyone woke.
    pub fn external_interrupt(&self, word: &AtomicU32, interrupted: P::Context) -> P::Context {
        let _exception = self.exceptions.enter();
        let mut cs = self.lock();
        let token = cs.token();

        word.fetch_add(1, Ordering::AcqRel);
        let (_, woken) = cs.futex_wake(token, word_key(word), u32::MAX);
        debug!("interrupt futex {:#x} woke {} threads", word_key(word), woken);

        let next = if woken > 0 {
            cs.sched.schedule(token, interrupted)
        } else {
            interrupted
        };
        let deadline = cs.sched.next_interrupt();
        drop(cs);
        self.platform.timer_set(deadline);
        next
    }

    // ------------------------------------------------------------------
    // Blocking support for the primitives
    // ------------------------------------------------------------------

    /// Suspend the running thread and switch away
    ///
    /// Consumes the critical section and hands back a fresh one after the
    /// thread runs again, together with whether `timeout` ran out.
    pub(crate) fn suspend_current<'k>(
        &'k self,
        mut cs: Section<'k, P>,
        timeout: &mut Timeout,
        wait_list: Option<WaitListId>,
        yield_unconditionally: bool,
        early_wake: bool,
    ) -> (Section<'k, P>, bool) {
        let token = cs.token();
        let me = match cs.sched.current() {
            Some(id) => id,
            None => panic!("blocking call with no running thread"),
        };

        if timeout.remaining != 0 {
            cs.sched.suspend(token, me, timeout.remaining, wait_list, early_wake);
        }
        if timeout.remaining != 0 || yield_unconditionally {
            let start = cs.sched.ticks();
            drop(cs);
            self.platform.yield_now(self);
            cs = self.lock();
            let elapsed = cs.sched.ticks().saturating_sub(start);
            timeout.elapse(u32::try_from(elapsed).unwrap_or(u32::MAX));
            if timeout.remaining > 0 {
                return (cs, false);
            }
        }
        (cs, true)
    }

    /// Yield if a wake made an equal-or-higher priority thread runnable
    ///
    /// Only from thread context; boot code and trap handlers just return.
    pub(crate) fn yield_if(&self, should_yield: bool) {
        if !should_yield || self.exceptions.depth() != 0 {
            return;
        }
        if self.lock().sched.current().is_some() {
            self.platform.yield_now(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, Machine, SimContext, SimPlatform};
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    #[test]
    fn test_kernel_creation() {
        let kernel = Kernel::new(SimPlatform::new());
        assert_eq!(kernel.thread_count(), 0);
        assert_eq!(kernel.ticks(), 0);
        assert_eq!(kernel.thread_id_get(), None);
    }

    #[test]
    fn test_thread_create_rejects_bad_priority() {
        let kernel = Kernel::new(SimPlatform::new());
        assert_eq!(
            kernel.thread_create(SimContext::IDLE, Priority(40)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_thread_ready_unknown_thread() {
        let kernel = Kernel::new(SimPlatform::new());
        assert_eq!(kernel.thread_ready(ThreadId(9)), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_exception_entry_picks_highest_priority() {
        let kernel = Kernel::new(SimPlatform::new());
        let low = kernel.thread_create(SimContext::IDLE, Priority(2)).unwrap();
        let high = kernel.thread_create(SimContext::IDLE, Priority(20)).unwrap();
        kernel.exception_entry(Trap::Yield, SimContext::IDLE);
        assert_eq!(kernel.thread_id_get(), Some(high));
        assert_ne!(low, high);
    }

    #[test]
    #[should_panic(expected = "interrupt context")]
    fn test_blocking_inside_exception_panics() {
        let kernel = Kernel::new(SimPlatform::new());
        let _exception = kernel.exceptions().enter();
        kernel.thread_yield();
    }

    #[test]
    fn test_higher_priority_preempts_on_wake() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let word = Arc::new(AtomicU32::new(0));
        let mut machine = Machine::new();

        let (l, w) = (log.clone(), word.clone());
        machine
            .spawn(10, move |k| {
                l.lock().unwrap().push("high waits");
                k.futex_wait(&mut Timeout::unlimited(), &w, 0).unwrap();
                l.lock().unwrap().push("high woke");
            })
            .unwrap();

        let (l, w) = (log.clone(), word.clone());
        machine
            .spawn(3, move |k| {
                l.lock().unwrap().push("low wakes");
                w.store(1, Ordering::Release);
                k.futex_wake(&w, 1).unwrap();
                l.lock().unwrap().push("low done");
            })
            .unwrap();

        machine.run().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["high waits", "low wakes", "high woke", "low done"]
        );
    }

    #[test]
    fn test_round_robin_by_timer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut machine = Machine::new();
        for name in ["a", "b", "c"] {
            let l = log.clone();
            machine
                .spawn(5, move |k| {
                    for _ in 0..3 {
                        l.lock().unwrap().push(name);
                        sim::run_for(k, 1);
                    }
                })
                .unwrap();
        }
        machine.run().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["a", "b", "c", "a", "b", "c", "a", "b", "c"]
        );
    }

    #[test]
    fn test_sleep_advances_time() {
        let elapsed = Arc::new(Mutex::new(None));
        let mut machine = Machine::new();
        let e = elapsed.clone();
        machine
            .spawn(4, move |k| {
                let mut t = Timeout::new(25);
                k.thread_sleep(&mut t, SleepFlags::NO_EARLY_WAKE);
                *e.lock().unwrap() = Some((t, k.ticks()));
            })
            .unwrap();
        machine.run().unwrap();
        let (t, now) = elapsed.lock().unwrap().unwrap();
        assert_eq!(t.elapsed, 25);
        assert_eq!(t.remaining, 0);
        assert_eq!(now, 25);
    }

    #[test]
    fn test_early_wake_sleep_returns_at_once_when_alone() {
        let elapsed = Arc::new(Mutex::new(None));
        let mut machine = Machine::new();
        let e = elapsed.clone();
        machine
            .spawn(4, move |k| {
                let mut t = Timeout::new(25);
                k.thread_sleep(&mut t, SleepFlags::empty());
                *e.lock().unwrap() = Some(t);
            })
            .unwrap();
        machine.run().unwrap();
        let t = elapsed.lock().unwrap().unwrap();
        assert_eq!(t.elapsed, 0);
        assert_eq!(t.remaining, 25);
    }

    #[test]
    fn test_thread_suspend_on_wait_list_and_delete() {
        let outcome = Arc::new(Mutex::new(None));
        let mut machine = Machine::new();
        let wl = machine.kernel().wait_list_create().unwrap();

        let o = outcome.clone();
        let sleeper = machine
            .spawn(6, move |k| {
                let timed_out = k.thread_suspend(&mut Timeout::new(100), Some(wl)).unwrap();
                let me = k.thread_id_get().unwrap();
                let reason = k.lock().sched.thread(me).and_then(|t| t.last_wake());
                *o.lock().unwrap() = Some((timed_out, reason));
            })
            .unwrap();
        machine
            .spawn(2, move |k| {
                k.wait_list_delete(wl).unwrap();
            })
            .unwrap();

        machine.run().unwrap();
        assert_eq!(
            *outcome.lock().unwrap(),
            Some((false, Some(WakeReason::Delete)))
        );
        assert_eq!(sleeper, ThreadId(1));
    }

    #[test]
    fn test_stale_wait_list_rejected_after_slot_reuse() {
        let kernel = Kernel::new(SimPlatform::new());
        let stale = kernel.wait_list_create().unwrap();
        kernel.wait_list_delete(stale).unwrap();
        let q = kernel.queue_create(4, 1).unwrap();

        assert_eq!(kernel.wait_list_delete(stale), Err(Error::InvalidArgument));
        let fresh = kernel.wait_list_create().unwrap();
        assert_ne!(fresh, stale);
        assert_eq!(kernel.queue_send(q, &[0; 4], &mut Timeout::non_blocking()), Ok(()));
        assert_eq!(kernel.queue_items_remaining(q), Ok(1));
    }

    #[test]
    fn test_thread_suspend_on_deleted_wait_list() {
        let result = Arc::new(Mutex::new(None));
        let mut machine = Machine::new();
        let stale = machine.kernel().wait_list_create().unwrap();
        machine.kernel().wait_list_delete(stale).unwrap();
        machine.kernel().wait_list_create().unwrap();

        let r = result.clone();
        machine
            .spawn(4, move |k| {
                *r.lock().unwrap() = Some(k.thread_suspend(&mut Timeout::new(5), Some(stale)));
            })
            .unwrap();
        machine.run().unwrap();
        assert_eq!(*result.lock().unwrap(), Some(Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_external_interrupt_wakes_futex_waiters() {
        let word = Arc::new(AtomicU32::new(0));
        let woke = Arc::new(Mutex::new(0u32));
        let mut machine = Machine::new();
        for _ in 0..2 {
            let (w, n) = (word.clone(), woke.clone());
            machine
                .spawn(8, move |k| {
                    k.futex_wait(&mut Timeout::unlimited(), &w, 0).unwrap();
                    *n.lock().unwrap() += 1;
                })
                .unwrap();
        }
        let w = word.clone();
        machine
            .spawn(1, move |k| {
                let me = sim::current_context();
                let next = k.external_interrupt(&w, me);
                k.platform().switch_to(me, next);
            })
            .unwrap();
        machine.run().unwrap();
        assert_eq!(word.load(Ordering::Acquire), 1);
        assert_eq!(*woke.lock().unwrap(), 2);
    }
}
