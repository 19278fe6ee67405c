//! Thread control blocks
//!
//! A thread is the schedulable unit: fixed priority, a three-state
//! lifecycle, two list memberships and a tagged "why am I waiting" payload.
//!
//! Author: Moroya Sakamoto

use crate::config::PRIORITY_LEVELS;
use crate::list::{Chain, Idx, Link, Node};
use crate::scheduler::WaitListId;
use crate::timer::UNBOUNDED_EXPIRY;

/// Stable thread identifier (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u16);

impl ThreadId {
    pub(crate) const fn from_index(idx: Idx) -> Self {
        ThreadId(idx as u16 + 1)
    }

    pub(crate) fn index(self) -> Option<Idx> {
        self.0.checked_sub(1).and_then(|i| Idx::try_from(i).ok())
    }
}

/// Thread priority, 0 (lowest) to 31 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Lowest priority
    pub const IDLE: Priority = Priority(0);
    /// Middle of the range
    pub const NORMAL: Priority = Priority(16);
    /// Highest priority
    pub const HIGHEST: Priority = Priority(PRIORITY_LEVELS as u8 - 1);

    /// Is this a usable priority level?
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < PRIORITY_LEVELS
    }
}

/// Thread lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a priority bucket, eligible to run
    Ready,
    /// On the timer list, possibly on a wait list too
    Suspended,
    /// Gone for good
    Exited,
}

/// Why a suspended thread was made ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Timeout expired (also used for boot and early wake)
    Timer,
    /// `futex_wake` on the awaited word
    Futex,
    /// Queue space or data became available
    Queue,
    /// Event group bits satisfied the wait
    Event,
    /// One of a multiwaiter's sources fired
    MultiWaiter,
    /// The awaited object was deleted
    Delete,
}

/// What an event-group waiter asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWait {
    /// Requested mask on entry; satisfying bits on wake; zero on timeout
    pub bits: u32,
    pub wait_all: bool,
    pub clear_on_exit: bool,
}

impl EventWait {
    /// Does `value` satisfy this wait?
    pub fn satisfied_by(&self, value: u32) -> bool {
        if self.wait_all {
            value & self.bits == self.bits
        } else {
            value & self.bits != 0
        }
    }
}

/// The one-word payload describing a blocked thread's wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPayload {
    /// Not waiting on anything that needs a payload
    None,
    /// Sleeping on this futex address
    Futex { address: usize },
    /// Sleeping on an event group
    Event(EventWait),
    /// Sleeping on the multiwaiter in this slab slot
    MultiWaiter { slot: u16 },
}

/// Thread control block
#[derive(Debug, Clone, Copy)]
pub struct Thread<C> {
    pub(crate) id: ThreadId,
    pub(crate) priority: Priority,
    pub(crate) state: ThreadState,
    pub(crate) links: [Option<Link>; 2],
    /// Wait list this thread is on, if any
    pub(crate) wait_list: Option<WaitListId>,
    /// Absolute tick at which a suspended thread times out
    pub(crate) expiry: u64,
    pub(crate) payload: WaitPayload,
    /// Sleeping in `thread_sleep` and may be woken early
    pub(crate) yielding: bool,
    pub(crate) last_wake: Option<WakeReason>,
    pub(crate) context: Option<C>,
}

impl<C> Thread<C> {
    /// Empty arena slot
    pub(crate) const fn empty() -> Self {
        Self {
            id: ThreadId(0),
            priority: Priority::IDLE,
            state: ThreadState::Exited,
            links: [None, None],
            wait_list: None,
            expiry: UNBOUNDED_EXPIRY,
            payload: WaitPayload::None,
            yielding: false,
            last_wake: None,
            context: None,
        }
    }

    /// Fresh thread, suspended until someone readies it
    pub(crate) fn new(idx: Idx, priority: Priority, context: C) -> Self {
        Self {
            id: ThreadId::from_index(idx),
            priority,
            state: ThreadState::Suspended,
            context: Some(context),
            ..Self::empty()
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn payload(&self) -> WaitPayload {
        self.payload
    }

    /// Reason for the most recent wake
    pub fn last_wake(&self) -> Option<WakeReason> {
        self.last_wake
    }

    /// Absolute expiry tick while suspended
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn is_ready(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn is_suspended(&self) -> bool {
        self.state == ThreadState::Suspended
    }

    /// Drop payload state that must not outlive a timeout or deletion
    pub(crate) fn discard_wait_result(&mut self) {
        match &mut self.payload {
            WaitPayload::Event(wait) => wait.bits = 0,
            WaitPayload::MultiWaiter { .. } => self.payload = WaitPayload::None,
            WaitPayload::Futex { .. } | WaitPayload::None => {}
        }
    }
}

impl<C> Node for Thread<C> {
    fn link(&self, chain: Chain) -> Option<Link> {
        self.links[chain as usize]
    }

    fn set_link(&mut self, chain: Chain, link: Option<Link>) {
        self.links[chain as usize] = link;
    }
}
