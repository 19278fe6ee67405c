//! Event groups
//!
//! 24 bits of level-triggered state. Waiters ask for any or all of a mask
//! and may consume the bits they waited for on the way out.
//!
//! Author: Moroya Sakamoto

use bitflags::bitflags;
use log::{debug, trace};

use crate::config::EVENT_BITS_MASK;
use crate::critical::IrqMasked;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::kernel::{Kernel, KernelState};
use crate::multiwait::{Notification, Source};
use crate::platform::Platform;
use crate::scheduler::WaitListId;
use crate::thread::{EventWait, WaitPayload, WakeReason};
use crate::timer::Timeout;

bitflags! {
    /// Options for event waits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventWaitFlags: u32 {
        /// Clear the awaited bits when the wait succeeds
        const CLEAR_ON_EXIT = 1 << 0;
        /// Wait for every bit in the mask rather than any
        const WAIT_ALL = 1 << 2;
    }
}

/// Bit-mask event group
pub struct EventGroup {
    bits: u32,
    waiters: WaitListId,
}

pub type EventHandle = Handle<EventGroup>;

impl EventGroup {
    pub(crate) fn bits(&self) -> u32 {
        self.bits
    }

    pub(crate) fn clear_bits(&mut self, bits: u32) {
        self.bits &= !bits;
    }
}

fn check_bits(bits: u32) -> Result<()> {
    if bits == 0 || bits & !EVENT_BITS_MASK != 0 {
        Err(Error::InvalidArgument)
    } else {
        Ok(())
    }
}

impl<C: Copy> KernelState<C> {
    /// OR `bits` in, wake satisfied waiters, then multiwaiters
    ///
    /// Returns the group's value afterwards and whether to yield.
    fn event_set(&mut self, cs: IrqMasked, handle: EventHandle, bits: u32) -> Result<(u32, bool)> {
        let (value, list) = match self.events.get_mut(handle) {
            Some(group) => {
                group.bits |= bits;
                (group.bits, group.waiters)
            }
            None => return Err(Error::InvalidArgument),
        };

        let mut cleared = 0u32;
        let mut should_yield = false;
        let waiters = self.sched.waiters(list);
        for &idx in waiters.as_slice() {
            let thread = self.sched.thread_at_mut(idx);
            let WaitPayload::Event(wait) = thread.payload else {
                continue;
            };
            if !wait.satisfied_by(value) {
                continue;
            }
            if wait.clear_on_exit {
                cleared |= wait.bits;
            }
            thread.payload = WaitPayload::Event(EventWait { bits: value, ..wait });
            trace!("event {:?} wakes thread {}", handle, idx + 1);
            should_yield |= self.sched.ready_index(cs, idx, WakeReason::Event);
        }
        if let Some(group) = self.events.get_mut(handle) {
            group.clear_bits(cleared);
        }

        let note = Notification::Event { event: handle, bits: value };
        let (_, mw_yield) = self.multiwaiter_notify(cs, note, u32::MAX);
        let after = self.events.get(handle).map_or(0, EventGroup::bits);
        Ok((after, should_yield || mw_yield))
    }
}

impl<P: Platform> Kernel<P> {
    /// Create an event group with every bit clear
    pub fn event_create(&self) -> Result<EventHandle> {
        let mut cs = self.lock();
        let token = cs.token();
        let waiters = cs.sched.wait_list_alloc(token).ok_or(Error::OutOfMemory)?;
        match cs.events.insert(EventGroup { bits: 0, waiters }) {
            Ok(handle) => Ok(handle),
            Err(_) => {
                cs.sched.wait_list_free(token, waiters);
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Delete an event group; blocked waiters wake with `Gone`
    pub fn event_delete(&self, handle: EventHandle) -> Result<()> {
        let mut cs = self.lock();
        let token = cs.token();
        let group = cs.events.remove(handle).ok_or(Error::InvalidArgument)?;

        let mut should_yield = false;
        while let Some(idx) = cs.sched.wait_list_head(group.waiters) {
            should_yield |= cs.sched.ready_index(token, idx, WakeReason::Delete);
        }
        cs.sched.wait_list_free(token, group.waiters);
        let note = Notification::Deleted(Source::Event(handle));
        let (_, mw_yield) = cs.multiwaiter_notify(token, note, u32::MAX);
        drop(cs);

        debug!("event group {:?} deleted", handle);
        self.yield_if(should_yield || mw_yield);
        Ok(())
    }

    /// Wait until the group's bits satisfy `bits` under `flags`
    ///
    /// Returns the group's value at the moment the wait was satisfied.
    pub fn event_wait(
        &self,
        handle: EventHandle,
        timeout: &mut Timeout,
        bits: u32,
        flags: EventWaitFlags,
    ) -> Result<u32> {
        check_bits(bits)?;
        let wait = EventWait {
            bits,
            wait_all: flags.contains(EventWaitFlags::WAIT_ALL),
            clear_on_exit: flags.contains(EventWaitFlags::CLEAR_ON_EXIT),
        };

        let mut cs = self.lock();
        let (value, list) = match cs.events.get(handle) {
            Some(group) => (group.bits, group.waiters),
            None => return Err(Error::InvalidArgument),
        };
        if wait.satisfied_by(value) {
            if wait.clear_on_exit {
                if let Some(group) = cs.events.get_mut(handle) {
                    group.clear_bits(bits);
                }
            }
            return Ok(value);
        }
        if !timeout.may_block() {
            return Err(Error::WouldBlock);
        }
        self.exceptions().assert_safe_to_block();

        cs.sched.set_current_payload(WaitPayload::Event(wait));
        let (mut cs, _) = self.suspend_current(cs, timeout, Some(list), false, false);
        let payload = cs.sched.take_current_payload();
        if cs.events.get(handle).is_none() {
            return Err(Error::Gone);
        }
        match payload {
            WaitPayload::Event(EventWait { bits, .. }) if bits != 0 => Ok(bits),
            _ => Err(Error::TimedOut),
        }
    }

    /// OR `bits` into the group and wake whoever that satisfies
    ///
    /// Returns the group's value after waiters consumed their bits.
    pub fn event_set(&self, handle: EventHandle, bits: u32) -> Result<u32> {
        if bits & !EVENT_BITS_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        let mut cs = self.lock();
        let token = cs.token();
        let (value, should_yield) = cs.event_set(token, handle, bits)?;
        drop(cs);

        self.yield_if(should_yield);
        Ok(value)
    }

    /// Clear `bits`, returning the value before clearing
    pub fn event_clear(&self, handle: EventHandle, bits: u32) -> Result<u32> {
        if bits & !EVENT_BITS_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        let mut cs = self.lock();
        let group = cs.events.get_mut(handle).ok_or(Error::InvalidArgument)?;
        let before = group.bits;
        group.clear_bits(bits);
        Ok(before)
    }

    pub fn event_get(&self, handle: EventHandle) -> Result<u32> {
        let cs = self.lock();
        cs.events
            .get(handle)
            .map(EventGroup::bits)
            .ok_or(Error::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SleepFlags;
    use crate::sim::{Machine, SimPlatform};
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    #[test]
    fn test_set_get_clear() {
        let kernel = Kernel::new(SimPlatform::new());
        let ev = kernel.event_create().unwrap();
        assert_eq!(kernel.event_set(ev, 0b1010), Ok(0b1010));
        assert_eq!(kernel.event_set(ev, 0b0001), Ok(0b1011));
        assert_eq!(kernel.event_clear(ev, 0b0010), Ok(0b1011));
        assert_eq!(kernel.event_get(ev), Ok(0b1001));
        assert_eq!(kernel.event_set(ev, 1 << 24), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_wait_validation() {
        let kernel = Kernel::new(SimPlatform::new());
        let ev = kernel.event_create().unwrap();
        let mut t = Timeout::non_blocking();
        assert_eq!(
            kernel.event_wait(ev, &mut t, 0, EventWaitFlags::empty()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            kernel.event_wait(ev, &mut t, 1 << 30, EventWaitFlags::empty()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            kernel.event_wait(ev, &mut t, 0b1, EventWaitFlags::empty()),
            Err(Error::WouldBlock)
        );
        kernel.event_delete(ev).unwrap();
        assert_eq!(kernel.event_get(ev), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_any_all_and_clear_on_exit() {
        let kernel = Kernel::new(SimPlatform::new());
        let ev = kernel.event_create().unwrap();
        kernel.event_set(ev, 0b0110).unwrap();
        let mut t = Timeout::non_blocking();

        assert_eq!(
            kernel.event_wait(ev, &mut t, 0b0011, EventWaitFlags::WAIT_ALL),
            Err(Error::WouldBlock)
        );
        assert_eq!(
            kernel.event_wait(ev, &mut t, 0b0011, EventWaitFlags::empty()),
            Ok(0b0110)
        );
        assert_eq!(
            kernel.event_wait(
                ev,
                &mut t,
                0b0110,
                EventWaitFlags::WAIT_ALL | EventWaitFlags::CLEAR_ON_EXIT
            ),
            Ok(0b0110)
        );
        assert_eq!(kernel.event_get(ev), Ok(0));
    }

    #[test]
    fn test_set_wakes_satisfied_waiters_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let finals = Arc::new(Mutex::new(Vec::new()));
        let mut machine = Machine::new();
        let ev = machine.kernel().event_create().unwrap();

        for (name, bits, flags) in [
            ("all", 0b11, EventWaitFlags::WAIT_ALL),
            ("any", 0b01, EventWaitFlags::CLEAR_ON_EXIT),
        ] {
            let l = log.clone();
            machine
                .spawn(7, move |k| {
                    let got = k.event_wait(ev, &mut Timeout::new(20), bits, flags);
                    l.lock().unwrap().push((name, got, k.ticks()));
                })
                .unwrap();
        }
        let f = finals.clone();
        machine
            .spawn(2, move |k| {
                k.thread_sleep(&mut Timeout::new(5), SleepFlags::NO_EARLY_WAKE);
                f.lock().unwrap().push(k.event_set(ev, 0b01).unwrap());
            })
            .unwrap();

        machine.run().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            [("any", Ok(0b01), 5), ("all", Err(Error::TimedOut), 20)]
        );
        assert_eq!(*finals.lock().unwrap(), [0]);
    }

    #[test]
    fn test_delete_wakes_waiter() {
        let result = Arc::new(Mutex::new(None));
        let mut machine = Machine::new();
        let ev = machine.kernel().event_create().unwrap();
        let r = result.clone();
        machine
            .spawn(7, move |k| {
                *r.lock().unwrap() = Some(k.event_wait(
                    ev,
                    &mut Timeout::unlimited(),
                    0b1,
                    EventWaitFlags::empty(),
                ));
            })
            .unwrap();
        machine
            .spawn(2, move |k| {
                k.event_delete(ev).unwrap();
            })
            .unwrap();
        machine.run().unwrap();
        assert_eq!(*result.lock().unwrap(), Some(Err(Error::Gone)));
    }
}
