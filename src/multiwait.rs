//! Multiwaiters
//!
//! Block one thread on several sources at once: futex words, queue
//! readiness and event-group bits. Each source kind notifies multiwaiters
//! after waking its own direct waiters.
//!
//! A multiwaiter whose thread has been readied but has not yet collected
//! its results sits on a pending list. Pending multiwaiters keep absorbing
//! notifications, so nothing that fires in that window is lost.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, trace};

use crate::config::{EVENT_BITS_MASK, MULTIWAITER_MAX_SOURCES};
use crate::critical::IrqMasked;
use crate::error::{Error, Result};
use crate::event::{EventHandle, EventWaitFlags};
use crate::futex::word_key;
use crate::handle::Handle;
use crate::kernel::{Kernel, KernelState};
use crate::list::Idx;
use crate::platform::Platform;
use crate::queue::QueueHandle;
use crate::thread::{EventWait, WaitPayload, WakeReason};
use crate::timer::Timeout;

/// Set in `fired` when the watched object was deleted
pub const SOURCE_GONE: u32 = 1 << 31;

bitflags! {
    /// Queue conditions a multiwaiter can watch
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueReady: u32 {
        /// Space to send
        const SEND = 1 << 0;
        /// Data to receive
        const RECEIVE = 1 << 1;
    }
}

/// One thing to wait for
#[derive(Debug, Clone, Copy)]
pub enum WaitSource<'a> {
    /// Fires once `word` no longer holds `expected`, or on a wake
    Futex { word: &'a AtomicU32, expected: u32 },
    /// Fires when the queue can be sent to or received from
    Queue { queue: QueueHandle, ready: QueueReady },
    /// Fires when the group's bits satisfy `bits` under `flags`
    Event { event: EventHandle, bits: u32, flags: EventWaitFlags },
}

/// Caller-side descriptor: a source in, a result out
#[derive(Debug, Clone, Copy)]
pub struct WaitDescriptor<'a> {
    pub source: WaitSource<'a>,
    /// Filled in by `multiwaiter_wait`; zero if this source did not fire
    pub fired: u32,
}

impl<'a> WaitDescriptor<'a> {
    pub fn futex(word: &'a AtomicU32, expected: u32) -> Self {
        Self::from(WaitSource::Futex { word, expected })
    }

    pub fn queue(queue: QueueHandle, ready: QueueReady) -> Self {
        Self::from(WaitSource::Queue { queue, ready })
    }

    pub fn event(event: EventHandle, bits: u32, flags: EventWaitFlags) -> Self {
        Self::from(WaitSource::Event { event, bits, flags })
    }
}

impl<'a> From<WaitSource<'a>> for WaitDescriptor<'a> {
    fn from(source: WaitSource<'a>) -> Self {
        Self { source, fired: 0 }
    }
}

/// Kernel-side copy of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Futex(usize),
    Queue(QueueHandle),
    Event(EventHandle),
}

/// Something happened to a source
#[derive(Debug, Clone, Copy)]
pub(crate) enum Notification {
    Futex(usize),
    Queue {
        queue: QueueHandle,
        full: bool,
        empty: bool,
    },
    Event {
        event: EventHandle,
        bits: u32,
    },
    Deleted(Source),
}

#[derive(Debug, Clone, Copy)]
struct EventWaiter {
    source: Source,
    /// Expected futex value or requested event bits
    value: u32,
    /// `QueueReady` or `EventWaitFlags` bits
    flags: u32,
    /// What has fired so far
    ready: u32,
}

impl EventWaiter {
    const UNUSED: Self = Self {
        source: Source::Futex(0),
        value: 0,
        flags: 0,
        ready: 0,
    };

    /// Feed `note` to this source
    ///
    /// Returns whether it fired, and event bits to auto-clear.
    fn trigger(&mut self, note: &Notification) -> (bool, u32) {
        match (self.source, *note) {
            (Source::Futex(address), Notification::Futex(key)) if address == key => {
                self.ready |= 1;
                (true, 0)
            }
            (Source::Queue(mine), Notification::Queue { queue, full, empty }) if mine == queue => {
                let watch = QueueReady::from_bits_truncate(self.flags);
                if watch.contains(QueueReady::SEND) && !full {
                    self.ready |= QueueReady::SEND.bits();
                }
                if watch.contains(QueueReady::RECEIVE) && !empty {
                    self.ready |= QueueReady::RECEIVE.bits();
                }
                (self.ready != 0, 0)
            }
            (Source::Event(mine), Notification::Event { event, bits }) if mine == event => {
                let flags = EventWaitFlags::from_bits_truncate(self.flags);
                let wait = EventWait {
                    bits: self.value,
                    wait_all: flags.contains(EventWaitFlags::WAIT_ALL),
                    clear_on_exit: flags.contains(EventWaitFlags::CLEAR_ON_EXIT),
                };
                if !wait.satisfied_by(bits) {
                    return (false, 0);
                }
                self.ready |= bits & self.value;
                (true, if wait.clear_on_exit { wait.bits } else { 0 })
            }
            (mine, Notification::Deleted(gone)) if mine == gone => {
                self.ready |= SOURCE_GONE;
                (true, 0)
            }
            _ => (false, 0),
        }
    }
}

/// A set of sources one thread can block on
pub struct MultiWaiter {
    capacity: u8,
    used: u8,
    events: [EventWaiter; MULTIWAITER_MAX_SOURCES],
    /// Thread blocked in `multiwaiter_wait`
    owner: Option<Idx>,
    /// On the woken list
    pending: bool,
    pending_next: Option<u16>,
}

pub type MultiWaiterHandle = Handle<MultiWaiter>;

impl MultiWaiter {
    fn new(capacity: u8) -> Self {
        Self {
            capacity,
            used: 0,
            events: [EventWaiter::UNUSED; MULTIWAITER_MAX_SOURCES],
            owner: None,
            pending: false,
            pending_next: None,
        }
    }

    fn sources(&mut self) -> &mut [EventWaiter] {
        &mut self.events[..self.used as usize]
    }

    /// Returns whether any source fired, and event bits to auto-clear
    fn trigger(&mut self, note: &Notification) -> (bool, u32) {
        let mut fired = false;
        let mut clear = 0;
        for source in self.sources() {
            let (hit, bits) = source.trigger(note);
            fired |= hit;
            clear |= bits;
        }
        (fired, clear)
    }

    /// Copy results out; bit i of the result is set if descriptor i fired
    fn collect(&self, descriptors: &mut [WaitDescriptor<'_>]) -> u8 {
        let mut mask = 0u8;
        for (i, (descriptor, source)) in descriptors.iter_mut().zip(&self.events).enumerate() {
            descriptor.fired = source.ready;
            if source.ready != 0 {
                mask |= 1 << i;
            }
        }
        mask
    }
}

impl<C: Copy> KernelState<C> {
    /// Feed `note` to pending multiwaiters, then wake up to `max_wakes`
    /// blocked ones it fires
    ///
    /// Returns how many threads woke and whether the caller should yield.
    pub(crate) fn multiwaiter_notify(
        &mut self,
        cs: IrqMasked,
        note: Notification,
        max_wakes: u32,
    ) -> (u32, bool) {
        let KernelState {
            sched,
            events,
            multiwaiters,
            multiwaiter_threads,
            woken_multiwaiters,
            ..
        } = self;

        let mut clear = 0u32;
        let mut cursor = *woken_multiwaiters;
        while let Some(slot) = cursor {
            let Some(mw) = multiwaiters.slot_mut(slot) else {
                break;
            };
            clear |= mw.trigger(&note).1;
            cursor = mw.pending_next;
        }

        let mut woken = 0u32;
        let mut should_yield = false;
        let waiters = sched.waiters(*multiwaiter_threads);
        for &idx in waiters.as_slice() {
            if woken == max_wakes {
                break;
            }
            let slot = match sched.thread_at(idx).payload {
                WaitPayload::MultiWaiter { slot } => slot,
                other => panic!("thread {} on the multiwaiter list with {:?}", idx + 1, other),
            };
            let Some(mw) = multiwaiters.slot_mut(slot) else {
                continue;
            };
            let (fired, bits) = mw.trigger(&note);
            clear |= bits;
            if !fired {
                continue;
            }
            mw.owner = None;
            mw.pending = true;
            mw.pending_next = *woken_multiwaiters;
            *woken_multiwaiters = Some(slot);
            trace!("multiwaiter {} fired for thread {}", slot, idx + 1);
            should_yield |= sched.ready_index(cs, idx, WakeReason::MultiWaiter);
            woken += 1;
        }

        if clear != 0 {
            if let Notification::Event { event, .. } = note {
                if let Some(group) = events.get_mut(event) {
                    group.clear_bits(clear);
                }
            }
        }
        (woken, should_yield)
    }

    /// Take `slot` off the woken list
    fn multiwaiter_unlink(&mut self, slot: u16) {
        let Some(mw) = self.multiwaiters.slot_mut(slot) else {
            return;
        };
        if !mw.pending {
            return;
        }
        mw.pending = false;
        let after = mw.pending_next.take();

        if self.woken_multiwaiters == Some(slot) {
            self.woken_multiwaiters = after;
            return;
        }
        let mut cursor = self.woken_multiwaiters;
        while let Some(current) = cursor {
            let Some(node) = self.multiwaiters.slot_mut(current) else {
                return;
            };
            if node.pending_next == Some(slot) {
                node.pending_next = after;
                return;
            }
            cursor = node.pending_next;
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Allocate a multiwaiter for up to `max_sources` descriptors
    pub fn multiwaiter_create(&self, max_sources: usize) -> Result<MultiWaiterHandle> {
        if max_sources > MULTIWAITER_MAX_SOURCES {
            return Err(Error::TooMany);
        }
        let mut cs = self.lock();
        cs.multiwaiters
            .insert(MultiWaiter::new(max_sources as u8))
            .map_err(|_| Error::OutOfMemory)
    }

    /// Free a multiwaiter; a thread blocked on it wakes as if timed out
    pub fn multiwaiter_delete(&self, handle: MultiWaiterHandle) -> Result<()> {
        let mut cs = self.lock();
        let token = cs.token();
        let owner = match cs.multiwaiters.get(handle) {
            Some(mw) => mw.owner,
            None => return Err(Error::InvalidArgument),
        };
        cs.multiwaiter_unlink(handle.index());

        let mut should_yield = false;
        if let Some(idx) = owner {
            if cs.sched.thread_at(idx).is_suspended() {
                should_yield = cs.sched.ready_index(token, idx, WakeReason::Timer);
            }
        }
        cs.multiwaiters.remove(handle);
        drop(cs);

        debug!("multiwaiter {:?} deleted", handle);
        self.yield_if(should_yield);
        Ok(())
    }

    /// Wait until at least one descriptor fires
    ///
    /// Returns a mask with bit i set for each descriptor i that fired;
    /// `fired` holds the details. Nothing firing within `timeout` is
    /// `TimedOut`.
    pub fn multiwaiter_wait(
        &self,
        handle: MultiWaiterHandle,
        descriptors: &mut [WaitDescriptor<'_>],
        timeout: &mut Timeout,
    ) -> Result<u8> {
        let mut cs = self.lock();
        let slot = handle.index();
        match cs.multiwaiters.get(handle) {
            None => return Err(Error::InvalidArgument),
            Some(mw) => {
                if descriptors.is_empty()
                    || descriptors.len() > mw.capacity as usize
                    || mw.owner.is_some()
                    || mw.pending
                {
                    return Err(Error::InvalidArgument);
                }
            }
        }

        let fired = self.arm(&mut cs, slot, descriptors)?;
        if !fired && timeout.may_block() {
            self.exceptions().assert_safe_to_block();
            let me = match cs.sched.current_index() {
                Some(idx) => idx,
                None => panic!("multiwaiter_wait with no running thread"),
            };
            cs.sched.set_current_payload(WaitPayload::MultiWaiter { slot });
            if let Some(mw) = cs.multiwaiters.get_mut(handle) {
                mw.owner = Some(me);
            }
            let list = cs.multiwaiter_threads;
            let (resumed, _) = self.suspend_current(cs, timeout, Some(list), false, false);
            cs = resumed;
            cs.sched.take_current_payload();
            match cs.multiwaiters.get_mut(handle) {
                Some(mw) => mw.owner = None,
                None => return Err(Error::InvalidArgument),
            }
        }

        cs.multiwaiter_unlink(slot);
        let mask = match cs.multiwaiters.get(handle) {
            Some(mw) => mw.collect(descriptors),
            None => 0,
        };
        if mask == 0 {
            Err(Error::TimedOut)
        } else {
            Ok(mask)
        }
    }

    /// Load `descriptors` into the multiwaiter in `slot` and probe each
    ///
    /// Returns whether anything is ready already.
    fn arm(&self, state: &mut KernelState<P::Context>, slot: u16, descriptors: &[WaitDescriptor<'_>]) -> Result<bool> {
        let KernelState {
            queues,
            events,
            multiwaiters,
            ..
        } = state;
        let Some(mw) = multiwaiters.slot_mut(slot) else {
            return Err(Error::InvalidArgument);
        };
        mw.used = 0;

        let mut fired = false;
        for (i, descriptor) in descriptors.iter().enumerate() {
            let waiter = match descriptor.source {
                WaitSource::Futex { word, expected } => {
                    let key = word_key(word);
                    if !self.platform().is_live(key) {
                        return Err(Error::InvalidArgument);
                    }
                    let mut waiter = EventWaiter {
                        source: Source::Futex(key),
                        value: expected,
                        flags: 0,
                        ready: 0,
                    };
                    if word.load(Ordering::Acquire) != expected {
                        waiter.ready = 1;
                    }
                    waiter
                }
                WaitSource::Queue { queue, ready } => {
                    if ready.is_empty() || !QueueReady::all().contains(ready) {
                        return Err(Error::InvalidArgument);
                    }
                    let (full, empty) = queues.get(queue).ok_or(Error::InvalidArgument)?.fill();
                    let mut waiter = EventWaiter {
                        source: Source::Queue(queue),
                        value: 0,
                        flags: ready.bits(),
                        ready: 0,
                    };
                    waiter.trigger(&Notification::Queue { queue, full, empty });
                    waiter
                }
                WaitSource::Event { event, bits, flags } => {
                    if bits == 0 || bits & !EVENT_BITS_MASK != 0 {
                        return Err(Error::InvalidArgument);
                    }
                    let group = events.get_mut(event).ok_or(Error::InvalidArgument)?;
                    let mut waiter = EventWaiter {
                        source: Source::Event(event),
                        value: bits,
                        flags: flags.bits(),
                        ready: 0,
                    };
                    let (_, clear) = waiter.trigger(&Notification::Event {
                        event,
                        bits: group.bits(),
                    });
                    group.clear_bits(clear);
                    waiter
                }
            };
            fired |= waiter.ready != 0;
            mw.events[i] = waiter;
            mw.used = i as u8 + 1;
        }
        Ok(fired)
    }
}
