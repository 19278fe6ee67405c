//! Message queues and semaphores
//!
//! Bounded FIFO of fixed-size items over a [`SlotRing`], with one wait list
//! for blocked senders and one for blocked receivers. A zero item size
//! makes the queue a counting semaphore: take is a send, give is a receive.
//!
//! Author: Moroya Sakamoto

use log::{debug, trace};

use crate::critical::IrqMasked;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::kernel::{Kernel, KernelState};
use crate::multiwait::{Notification, Source};
use crate::platform::Platform;
use crate::ring::SlotRing;
use crate::scheduler::WaitListId;
use crate::thread::WakeReason;
use crate::timer::Timeout;

/// Bounded message queue
pub struct Queue {
    ring: SlotRing,
    send_waiters: WaitListId,
    recv_waiters: WaitListId,
}

pub type QueueHandle = Handle<Queue>;

impl Queue {
    /// (full, empty)
    pub(crate) fn fill(&self) -> (bool, bool) {
        (self.ring.is_full(), self.ring.is_empty())
    }
}

/// Which side of the queue an operation is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Send,
    Receive,
}

impl<C: Copy> KernelState<C> {
    /// Tell multiwaiters the queue changed, then wake the best waiter on
    /// the opposite side
    fn queue_unblock_one(&mut self, cs: IrqMasked, handle: QueueHandle, list: WaitListId) -> bool {
        let note = match self.queues.get(handle) {
            Some(queue) => {
                let (full, empty) = queue.fill();
                Notification::Queue {
                    queue: handle,
                    full,
                    empty,
                }
            }
            None => Notification::Deleted(Source::Queue(handle)),
        };
        let (_, mw_yield) = self.multiwaiter_notify(cs, note, u32::MAX);
        let head_yield = match self.sched.wait_list_head(list) {
            Some(idx) => self.sched.ready_index(cs, idx, WakeReason::Queue),
            None => false,
        };
        mw_yield || head_yield
    }
}

impl<P: Platform> Kernel<P> {
    /// Create a queue of `capacity` items of `item_size` bytes
    pub fn queue_create(&self, item_size: usize, capacity: usize) -> Result<QueueHandle> {
        let ring = SlotRing::new(item_size, capacity)?;

        let mut cs = self.lock();
        let token = cs.token();
        let Some(send_waiters) = cs.sched.wait_list_alloc(token) else {
            return Err(Error::OutOfMemory);
        };
        let Some(recv_waiters) = cs.sched.wait_list_alloc(token) else {
            cs.sched.wait_list_free(token, send_waiters);
            return Err(Error::OutOfMemory);
        };
        let queue = Queue {
            ring,
            send_waiters,
            recv_waiters,
        };
        match cs.queues.insert(queue) {
            Ok(handle) => {
                debug!("queue {:?} created: {} x {} bytes", handle, capacity, item_size);
                Ok(handle)
            }
            Err(_) => {
                cs.sched.wait_list_free(token, send_waiters);
                cs.sched.wait_list_free(token, recv_waiters);
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Delete a queue; blocked senders and receivers wake with `Gone`
    pub fn queue_delete(&self, handle: QueueHandle) -> Result<()> {
        let mut cs = self.lock();
        let token = cs.token();
        let queue = cs.queues.remove(handle).ok_or(Error::InvalidArgument)?;

        let mut should_yield = false;
        for list in [queue.recv_waiters, queue.send_waiters] {
            while let Some(idx) = cs.sched.wait_list_head(list) {
                should_yield |= cs.sched.ready_index(token, idx, WakeReason::Delete);
            }
            cs.sched.wait_list_free(token, list);
        }
        let note = Notification::Deleted(Source::Queue(handle));
        let (_, mw_yield) = cs.multiwaiter_notify(token, note, u32::MAX);
        drop(cs);
        drop(queue);

        debug!("queue {:?} deleted", handle);
        self.yield_if(should_yield || mw_yield);
        Ok(())
    }

    /// Copy `item` onto the back of the queue
    ///
    /// Blocks while the queue is full. `WouldBlock` if full and `timeout`
    /// cannot block.
    pub fn queue_send(&self, handle: QueueHandle, item: &[u8], timeout: &mut Timeout) -> Result<()> {
        self.queue_transfer(handle, Side::Send, timeout, |ring| ring.push(item), item.len())
    }

    /// Copy the front item into `out`
    ///
    /// Blocks while the queue is empty. `WouldBlock` if empty and
    /// `timeout` cannot block.
    pub fn queue_recv(&self, handle: QueueHandle, out: &mut [u8], timeout: &mut Timeout) -> Result<()> {
        let len = out.len();
        self.queue_transfer(handle, Side::Receive, timeout, |ring| ring.pop(out), len)
    }

    /// Items currently queued
    pub fn queue_items_remaining(&self, handle: QueueHandle) -> Result<usize> {
        let cs = self.lock();
        cs.queues
            .get(handle)
            .map(|queue| queue.ring.len())
            .ok_or(Error::InvalidArgument)
    }

    /// Shared body of send and receive
    fn queue_transfer<F>(
        &self,
        handle: QueueHandle,
        side: Side,
        timeout: &mut Timeout,
        transfer: F,
        buffer_len: usize,
    ) -> Result<()>
    where
        F: FnOnce(&mut SlotRing),
    {
        let mut cs = self.lock();
        let (blocked, own_list) = match cs.queues.get(handle) {
            Some(queue) => {
                if buffer_len != queue.ring.item_size() {
                    return Err(Error::InvalidArgument);
                }
                match side {
                    Side::Send => (queue.ring.is_full(), queue.send_waiters),
                    Side::Receive => (queue.ring.is_empty(), queue.recv_waiters),
                }
            }
            None => return Err(Error::InvalidArgument),
        };

        if blocked {
            if !timeout.may_block() {
                return Err(Error::WouldBlock);
            }
            self.exceptions().assert_safe_to_block();
            loop {
                trace!("queue {:?} {:?} blocks {:?}", handle, side, cs.sched.current());
                let (resumed, timed_out) = self.suspend_current(cs, timeout, Some(own_list), false, false);
                cs = resumed;
                let still_blocked = match cs.queues.get(handle) {
                    Some(queue) => match side {
                        Side::Send => queue.ring.is_full(),
                        Side::Receive => queue.ring.is_empty(),
                    },
                    None => return Err(Error::Gone),
                };
                if !still_blocked {
                    break;
                }
                if timed_out {
                    return Err(Error::TimedOut);
                }
            }
        }

        let token = cs.token();
        let other_list = match cs.queues.get_mut(handle) {
            Some(queue) => {
                transfer(&mut queue.ring);
                match side {
                    Side::Send => queue.recv_waiters,
                    Side::Receive => queue.send_waiters,
                }
            }
            None => return Err(Error::Gone),
        };
        let should_yield = cs.queue_unblock_one(token, handle, other_list);
        drop(cs);

        self.yield_if(should_yield);
        Ok(())
    }

    /// Counting semaphore holding at most `max_count`
    pub fn semaphore_create(&self, max_count: usize) -> Result<QueueHandle> {
        self.queue_create(0, max_count)
    }

    /// Take one count; blocks while `max_count` are already taken
    pub fn semaphore_take(&self, semaphore: QueueHandle, timeout: &mut Timeout) -> Result<()> {
        self.queue_send(semaphore, &[], timeout)
    }

    /// Give one count back; never blocks
    pub fn semaphore_give(&self, semaphore: QueueHandle) -> Result<()> {
        match self.queue_recv(semaphore, &mut [], &mut Timeout::non_blocking()) {
            Err(Error::WouldBlock) => Err(Error::InvalidArgument),
            other => other,
        }
    }
}
