//! Priority scheduler
//!
//! O(1) fixed-priority scheduling over 32 ready buckets. A 32-bit occupancy
//! bitmap tracks which buckets are non-empty; the highest set bit is the
//! priority that runs next. Equal-priority threads round-robin.
//!
//! The thread arena, ready buckets, timer list and wait-list heads all live
//! in this one context object. Every mutating call takes an [`IrqMasked`]
//! token: the scheduler relies on interrupt masking for exclusion.
//!
//! Author: Moroya Sakamoto

use core::array;

use log::trace;

use crate::config::{MAX_THREADS, MAX_WAIT_LISTS, PRIORITY_LEVELS};
use crate::critical::IrqMasked;
use crate::error::{Error, Result};
use crate::list::{self, Chain, Idx, Snapshot};
use crate::thread::{Priority, Thread, ThreadId, ThreadState, WaitPayload, WakeReason};
use crate::timer::expiry_after;

/// Handle to a wait-list head owned by the scheduler
///
/// Carries the slot's generation, so an id kept past `wait_list_free`
/// never names the list that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitListId {
    slot: u8,
    generation: u16,
}

/// Scheduler context
///
/// Single instance per kernel. Threads are never freed; `exit` only marks
/// them dead.
pub struct Scheduler<C> {
    /// Thread arena
    threads: [Thread<C>; MAX_THREADS],
    /// Arena slots handed out so far
    created: usize,
    /// Threads that have not exited
    live: usize,
    /// Thread selected to run (None = idle)
    current: Option<Idx>,
    /// Context to resume when nothing is ready
    idle_context: Option<C>,
    /// One circular list per priority
    priority_list: [Option<Idx>; PRIORITY_LEVELS],
    /// Bit p set iff priority_list[p] is non-empty
    priority_map: u32,
    /// Highest set bit of priority_map, or 0
    highest_priority: u8,
    /// Every suspended thread, by expiry
    pub(crate) timer_list: Option<Idx>,
    /// Wait-list heads, addressed by WaitListId
    wait_lists: [Option<Idx>; MAX_WAIT_LISTS],
    wait_list_used: [bool; MAX_WAIT_LISTS],
    /// Bumped on every free
    wait_list_gen: [u16; MAX_WAIT_LISTS],
    /// Monotonic tick counter
    pub(crate) ticks: u64,
}

impl<C: Copy> Scheduler<C> {
    /// Empty scheduler, no threads, idle
    pub fn new() -> Self {
        Self {
            threads: array::from_fn(|_| Thread::empty()),
            created: 0,
            live: 0,
            current: None,
            idle_context: None,
            priority_list: [None; PRIORITY_LEVELS],
            priority_map: 0,
            highest_priority: 0,
            timer_list: None,
            wait_lists: [None; MAX_WAIT_LISTS],
            wait_list_used: [false; MAX_WAIT_LISTS],
            wait_list_gen: [0; MAX_WAIT_LISTS],
            ticks: 0,
        }
    }

    /// Add a thread in the suspended state with no timeout
    ///
    /// The caller readies it to make it runnable.
    pub fn create(&mut self, _cs: IrqMasked, context: C, priority: Priority) -> Result<ThreadId> {
        if !priority.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.created >= MAX_THREADS {
            return Err(Error::OutOfMemory);
        }
        let idx = self.created as Idx;
        self.threads[idx as usize] = Thread::new(idx, priority, context);
        list::insert(&mut self.threads, &mut self.timer_list, idx, Chain::Timer, expires_first);
        self.created += 1;
        self.live += 1;
        trace!("thread {} created at priority {}", idx + 1, priority.0);
        Ok(ThreadId::from_index(idx))
    }

    /// Make a suspended thread runnable
    ///
    /// Returns true if the caller should yield: the woken thread's priority
    /// is at least that of the running thread.
    pub fn ready(&mut self, cs: IrqMasked, id: ThreadId, reason: WakeReason) -> bool {
        let idx = self.index_of(id);
        self.ready_index(cs, idx, reason)
    }

    pub(crate) fn ready_index(&mut self, _cs: IrqMasked, idx: Idx, reason: WakeReason) -> bool {
        let thread = &self.threads[idx as usize];
        assert!(
            thread.state == ThreadState::Suspended,
            "readying thread {} in state {:?}",
            idx + 1,
            thread.state
        );

        list::remove(&mut self.threads, &mut self.timer_list, idx, Chain::Timer);
        if let Some(wl) = self.threads[idx as usize].wait_list.take() {
            list::remove(&mut self.threads, &mut self.wait_lists[wl.slot as usize], idx, Chain::Run);
        }

        let thread = &mut self.threads[idx as usize];
        thread.state = ThreadState::Ready;
        thread.yielding = false;
        thread.last_wake = Some(reason);
        if matches!(reason, WakeReason::Timer | WakeReason::Delete) {
            thread.discard_wait_result();
        }
        let priority = thread.priority.0;

        if self.priority_list[priority as usize].is_none() {
            self.priority_map |= 1 << priority;
            if priority > self.highest_priority {
                self.highest_priority = priority;
            }
        }
        list::insert(
            &mut self.threads,
            &mut self.priority_list[priority as usize],
            idx,
            Chain::Run,
            runs_first,
        );
        trace!("thread {} ready ({:?})", idx + 1, reason);

        match self.current {
            Some(cur) => priority >= self.threads[cur as usize].priority.0,
            None => true,
        }
    }

    /// Take the running thread off its bucket
    ///
    /// `wait_ticks` is relative; `u32::MAX` never expires. With a wait list
    /// the thread is queued on it by priority as well.
    pub fn suspend(
        &mut self,
        _cs: IrqMasked,
        id: ThreadId,
        wait_ticks: u32,
        wait_list: Option<WaitListId>,
        yielding: bool,
    ) {
        let idx = self.index_of(id);
        assert_eq!(
            self.current,
            Some(idx),
            "suspending thread {} which is not running",
            idx + 1
        );
        let thread = &self.threads[idx as usize];
        assert!(
            thread.state == ThreadState::Ready,
            "suspending thread {} in state {:?}",
            idx + 1,
            thread.state
        );
        let priority = thread.priority.0;

        list::remove(
            &mut self.threads,
            &mut self.priority_list[priority as usize],
            idx,
            Chain::Run,
        );
        self.threads[idx as usize].state = ThreadState::Suspended;
        self.priority_map_remove(priority);

        if let Some(wl) = wait_list {
            assert!(self.wait_list_in_use(wl), "suspending on a freed wait list");
            list::insert(
                &mut self.threads,
                &mut self.wait_lists[wl.slot as usize],
                idx,
                Chain::Run,
                runs_first,
            );
            self.threads[idx as usize].wait_list = Some(wl);
        }

        let thread = &mut self.threads[idx as usize];
        thread.expiry = expiry_after(self.ticks, wait_ticks);
        thread.yielding = yielding;
        list::insert(&mut self.threads, &mut self.timer_list, idx, Chain::Timer, expires_first);
        trace!("thread {} suspended for {} ticks", idx + 1, wait_ticks);
    }

    /// Pick the next thread and return the context to resume
    ///
    /// `interrupted` is the context that was running. A running thread that
    /// is still ready goes to the back of its bucket.
    pub fn schedule(&mut self, _cs: IrqMasked, interrupted: C) -> C {
        match self.current {
            Some(cur) => {
                let thread = &self.threads[cur as usize];
                if thread.state == ThreadState::Ready {
                    let priority = thread.priority.0 as usize;
                    if self.priority_list[priority] == Some(cur) {
                        self.priority_list[priority] = Some(list::next(&self.threads, cur, Chain::Run));
                    }
                }
                self.threads[cur as usize].context = Some(interrupted);
            }
            None => self.idle_context = Some(interrupted),
        }

        self.current = self.priority_list[self.highest_priority as usize];
        match self.current {
            Some(next) => {
                let thread = &self.threads[next as usize];
                assert_eq!(
                    thread.priority.0, self.highest_priority,
                    "bucket {} holds a thread of priority {}",
                    self.highest_priority, thread.priority.0
                );
                match thread.context {
                    Some(ctx) => ctx,
                    None => panic!("thread {} has no saved context", next + 1),
                }
            }
            None => match self.idle_context {
                Some(ctx) => ctx,
                None => interrupted,
            },
        }
    }

    /// Retire the running thread
    ///
    /// Returns true if it was the last live thread.
    pub fn exit(&mut self, _cs: IrqMasked) -> bool {
        let idx = match self.current {
            Some(idx) => idx,
            None => panic!("exit with no running thread"),
        };
        let thread = &self.threads[idx as usize];
        assert!(
            thread.state == ThreadState::Ready,
            "exiting thread {} in state {:?}",
            idx + 1,
            thread.state
        );
        let priority = thread.priority.0;
        list::remove(
            &mut self.threads,
            &mut self.priority_list[priority as usize],
            idx,
            Chain::Run,
        );
        self.threads[idx as usize].state = ThreadState::Exited;
        self.priority_map_remove(priority);
        self.live -= 1;
        trace!("thread {} exited, {} left", idx + 1, self.live);
        self.live == 0
    }

    fn priority_map_remove(&mut self, priority: u8) {
        if self.priority_list[priority as usize].is_none() {
            self.priority_map &= !(1 << priority);
            self.highest_priority = if self.priority_map == 0 {
                0
            } else {
                (31 - self.priority_map.leading_zeros()) as u8
            };
        }
    }

    /// Allocate an empty wait list
    pub fn wait_list_alloc(&mut self, _cs: IrqMasked) -> Option<WaitListId> {
        let slot = self.wait_list_used.iter().position(|used| !used)?;
        self.wait_list_used[slot] = true;
        self.wait_lists[slot] = None;
        Some(WaitListId {
            slot: slot as u8,
            generation: self.wait_list_gen[slot],
        })
    }

    /// Return a wait list to the pool; it must be empty
    pub fn wait_list_free(&mut self, _cs: IrqMasked, wl: WaitListId) {
        let slot = wl.slot as usize;
        assert!(self.wait_list_in_use(wl), "double free of wait list {}", slot);
        assert!(self.wait_lists[slot].is_none(), "freeing wait list {} with waiters", slot);
        self.wait_list_used[slot] = false;
        self.wait_list_gen[slot] = self.wait_list_gen[slot].wrapping_add(1);
    }

    /// Is `wl` allocated and not a stale id for a reused slot?
    pub fn wait_list_in_use(&self, wl: WaitListId) -> bool {
        let slot = wl.slot as usize;
        slot < MAX_WAIT_LISTS && self.wait_list_used[slot] && self.wait_list_gen[slot] == wl.generation
    }

    /// Waiters on `wl`, highest priority first
    pub(crate) fn waiters(&self, wl: WaitListId) -> Snapshot {
        Snapshot::of(&self.threads, self.wait_lists[wl.slot as usize], Chain::Run)
    }

    /// Highest-priority waiter on `wl`
    pub(crate) fn wait_list_head(&self, wl: WaitListId) -> Option<Idx> {
        self.wait_lists[wl.slot as usize]
    }

    /// Suspended threads by expiry
    #[cfg(test)]
    pub(crate) fn sleepers(&self) -> Snapshot {
        Snapshot::of(&self.threads, self.timer_list, Chain::Timer)
    }

    fn index_of(&self, id: ThreadId) -> Idx {
        match id.index() {
            Some(idx) if (idx as usize) < self.created => idx,
            _ => panic!("no such thread {:?}", id),
        }
    }

    /// Look up a thread by id
    pub fn thread(&self, id: ThreadId) -> Option<&Thread<C>> {
        let idx = id.index()? as usize;
        if idx < self.created {
            Some(&self.threads[idx])
        } else {
            None
        }
    }

    pub(crate) fn thread_at(&self, idx: Idx) -> &Thread<C> {
        &self.threads[idx as usize]
    }

    pub(crate) fn thread_at_mut(&mut self, idx: Idx) -> &mut Thread<C> {
        &mut self.threads[idx as usize]
    }

    /// Running thread, if any
    pub fn current(&self) -> Option<ThreadId> {
        self.current.map(ThreadId::from_index)
    }

    pub(crate) fn current_index(&self) -> Option<Idx> {
        self.current
    }

    /// Is the running thread still on its bucket?
    pub fn current_is_ready(&self) -> bool {
        self.current
            .is_some_and(|idx| self.threads[idx as usize].state == ThreadState::Ready)
    }

    /// Are there other ready threads at the running thread's priority?
    pub fn has_priority_peers(&self) -> bool {
        match self.current {
            Some(idx) => {
                let thread = &self.threads[idx as usize];
                thread.state == ThreadState::Ready
                    && list::next(&self.threads, idx, Chain::Run) != idx
            }
            None => false,
        }
    }

    pub fn any_ready(&self) -> bool {
        self.priority_map != 0
    }

    pub fn priority_map(&self) -> u32 {
        self.priority_map
    }

    pub fn highest_priority(&self) -> u8 {
        self.highest_priority
    }

    /// Threads ever created
    pub fn thread_count(&self) -> usize {
        self.created
    }

    /// Threads that have not exited
    pub fn live_threads(&self) -> usize {
        self.live
    }

    /// Payload of the running thread
    pub(crate) fn set_current_payload(&mut self, payload: WaitPayload) {
        if let Some(idx) = self.current {
            self.threads[idx as usize].payload = payload;
        }
    }

    /// Swap out the running thread's payload
    pub(crate) fn take_current_payload(&mut self) -> WaitPayload {
        match self.current {
            Some(idx) => core::mem::replace(&mut self.threads[idx as usize].payload, WaitPayload::None),
            None => WaitPayload::None,
        }
    }
}

impl<C: Copy> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait-list and bucket order: higher priority first
fn runs_first<C>(a: &Thread<C>, b: &Thread<C>) -> bool {
    a.priority > b.priority
}

/// Timer-list order: earlier expiry first
fn expires_first<C>(a: &Thread<C>, b: &Thread<C>) -> bool {
    a.expiry < b.expiry
}
