//! Host simulator
//!
//! Runs kernel threads as OS threads that pass a single virtual CPU
//! between them, so the blocking primitives can be exercised under
//! `cargo test`. Exactly one simulated context owns the CPU at a time;
//! every other thread is parked on a condition variable. The context
//! switch is `exception_entry` followed by a hand-off to whichever
//! context it returns.
//!
//! When nothing is runnable the idle loop delivers timer interrupts until
//! a sleeper expires. A machine with blocked threads and no timer armed is
//! deadlocked and stops with [`SimError::Deadlock`].
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::boxed::Box;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::vec::Vec;

use log::{debug, warn};

use crate::error::Result;
use crate::futex::word_key;
use crate::kernel::{Kernel, Trap};
use crate::platform::Platform;
use crate::thread::{Priority, ThreadId};

/// Default idle-tick budget for [`Machine::run`]
pub const DEFAULT_TICK_LIMIT: u64 = 1_000_000;

/// Saved context of a simulated thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimContext(u16);

impl SimContext {
    /// The idle loop
    pub const IDLE: SimContext = SimContext(0);
}

thread_local! {
    static RUNNING_AS: Cell<SimContext> = const { Cell::new(SimContext::IDLE) };
}

/// Context of the calling OS thread
pub fn current_context() -> SimContext {
    RUNNING_AS.with(Cell::get)
}

/// Why a run stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error("deadlock at tick {ticks}: {blocked} threads blocked with no timer armed")]
    Deadlock { ticks: u64, blocked: usize },
    #[error("tick limit {0} reached")]
    TickLimit(u64),
}

/// Unwind payload that retires parked threads when the machine stops
struct Halted;

struct Cpu {
    owner: SimContext,
    halted: bool,
    failure: Option<Box<dyn Any + Send>>,
}

/// [`Platform`] for the simulator
pub struct SimPlatform {
    cpu: Mutex<Cpu>,
    handoff: Condvar,
    irq_enabled: AtomicBool,
    timer: Mutex<Option<u64>>,
    revoked: Mutex<BTreeSet<usize>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            cpu: Mutex::new(Cpu {
                owner: SimContext::IDLE,
                halted: false,
                failure: None,
            }),
            handoff: Condvar::new(),
            irq_enabled: AtomicBool::new(true),
            timer: Mutex::new(None),
            revoked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Give the CPU from `me` to `to` and park until `me` gets it back
    ///
    /// Unwinds the calling thread if the machine halts meanwhile.
    pub fn switch_to(&self, me: SimContext, to: SimContext) {
        if me == to {
            return;
        }
        let mut cpu = relock(&self.cpu);
        cpu.owner = to;
        self.handoff.notify_all();
        while cpu.owner != me && !cpu.halted {
            cpu = self.handoff.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
        if cpu.owner != me {
            drop(cpu);
            panic::resume_unwind(Box::new(Halted));
        }
    }

    /// Make `address` invalid for futex calls
    pub fn revoke(&self, address: usize) {
        relock(&self.revoked).insert(address);
    }

    pub fn revoke_word(&self, word: &AtomicU32) {
        self.revoke(word_key(word));
    }

    /// Deadline of the armed timer interrupt
    pub fn armed_timer(&self) -> Option<u64> {
        *relock(&self.timer)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::SeqCst)
    }

    fn hand_off(&self, to: SimContext) {
        let mut cpu = relock(&self.cpu);
        cpu.owner = to;
        self.handoff.notify_all();
    }

    /// Park a new thread until it is first scheduled; false if the
    /// machine stopped first
    fn wait_turn(&self, me: SimContext) -> bool {
        let mut cpu = relock(&self.cpu);
        while cpu.owner != me && !cpu.halted {
            cpu = self.handoff.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
        !cpu.halted
    }

    /// Idle loop side of `switch_to`; false if the machine halted
    fn run_until_idle(&self, to: SimContext) -> bool {
        let mut cpu = relock(&self.cpu);
        cpu.owner = to;
        self.handoff.notify_all();
        while cpu.owner != SimContext::IDLE && !cpu.halted {
            cpu = self.handoff.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
        !cpu.halted
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        let mut cpu = relock(&self.cpu);
        if cpu.failure.is_none() {
            cpu.failure = Some(payload);
        }
        cpu.halted = true;
        self.handoff.notify_all();
    }

    fn halt(&self) -> Option<Box<dyn Any + Send>> {
        let mut cpu = relock(&self.cpu);
        cpu.halted = true;
        self.handoff.notify_all();
        cpu.failure.take()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    type Context = SimContext;

    fn interrupts_disable(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::SeqCst)
    }

    fn interrupts_restore(&self, was_enabled: bool) {
        self.irq_enabled.store(was_enabled, Ordering::SeqCst);
    }

    fn yield_now(&self, kernel: &Kernel<Self>) {
        let me = current_context();
        let next = kernel.exception_entry(Trap::Yield, me);
        self.switch_to(me, next);
    }

    fn timer_set(&self, deadline: Option<u64>) {
        *relock(&self.timer) = deadline;
    }

    fn is_live(&self, address: usize) -> bool {
        !relock(&self.revoked).contains(&address)
    }
}

/// Deliver `ticks` timer interrupts to the running simulated thread
///
/// Stands in for a thread that computes without blocking.
pub fn run_for(kernel: &Kernel<SimPlatform>, ticks: u32) {
    let me = current_context();
    for _ in 0..ticks {
        let next = kernel.exception_entry(Trap::Timer, me);
        kernel.platform().switch_to(me, next);
    }
}

/// What a completed run looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Tick counter when the last thread exited
    pub ticks: u64,
}

/// A simulated single-core machine
pub struct Machine {
    kernel: Arc<Kernel<SimPlatform>>,
    threads: Vec<JoinHandle<()>>,
    next_context: u16,
    tick_limit: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            kernel: Arc::new(Kernel::new(SimPlatform::new())),
            threads: Vec::new(),
            next_context: 0,
            tick_limit: DEFAULT_TICK_LIMIT,
        }
    }

    /// Stop with [`SimError::TickLimit`] after `limit` ticks
    pub fn with_tick_limit(mut self, limit: u64) -> Self {
        self.tick_limit = limit;
        self
    }

    pub fn kernel(&self) -> &Arc<Kernel<SimPlatform>> {
        &self.kernel
    }

    /// Create a runnable thread that executes `body`
    pub fn spawn<F>(&mut self, priority: u8, body: F) -> Result<ThreadId>
    where
        F: FnOnce(&Kernel<SimPlatform>) + Send + 'static,
    {
        let context = SimContext(self.next_context + 1);
        let id = self.kernel.thread_create(context, Priority(priority))?;
        self.next_context += 1;

        let kernel = Arc::clone(&self.kernel);
        self.threads
            .push(thread::spawn(move || thread_main(kernel, context, body)));
        Ok(id)
    }

    /// Run until every thread has exited
    ///
    /// A panic in any simulated thread is re-raised here.
    pub fn run(mut self) -> core::result::Result<RunReport, SimError> {
        RUNNING_AS.with(|c| c.set(SimContext::IDLE));
        let kernel = Arc::clone(&self.kernel);
        let platform = kernel.platform();

        let mut next = kernel.exception_entry(Trap::Yield, SimContext::IDLE);
        let outcome = loop {
            if !platform.run_until_idle(next) || kernel.live_threads() == 0 {
                break Ok(());
            }
            let ticks = kernel.ticks();
            if platform.armed_timer().is_none() {
                let blocked = kernel.live_threads();
                warn!("deadlock at tick {}: {} threads blocked", ticks, blocked);
                break Err(SimError::Deadlock { ticks, blocked });
            }
            if ticks >= self.tick_limit {
                break Err(SimError::TickLimit(self.tick_limit));
            }
            next = kernel.exception_entry(Trap::Timer, SimContext::IDLE);
        };

        self.shut_down();
        debug!("machine stopped at tick {}", kernel.ticks());
        outcome.map(|()| RunReport {
            ticks: kernel.ticks(),
        })
    }

    /// Halt, retire every parked thread and re-raise the first failure
    fn shut_down(&mut self) {
        let failure = self.kernel.platform().halt();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(payload) = failure {
            panic::resume_unwind(payload);
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.kernel.platform().halt();
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn thread_main<F>(kernel: Arc<Kernel<SimPlatform>>, context: SimContext, body: F)
where
    F: FnOnce(&Kernel<SimPlatform>),
{
    RUNNING_AS.with(|c| c.set(context));
    let platform = kernel.platform();
    if !platform.wait_turn(context) {
        return;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| body(&kernel))) {
        Ok(()) => {
            let next = kernel.exception_entry(Trap::ThreadExit, context);
            platform.hand_off(next);
        }
        Err(payload) if payload.is::<Halted>() => {}
        Err(payload) => platform.fail(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SleepFlags;
    use crate::timer::Timeout;

    #[test]
    fn test_empty_machine_runs() {
        let report = Machine::new().run().unwrap();
        assert_eq!(report.ticks, 0);
    }

    #[test]
    fn test_report_counts_ticks() {
        let mut machine = Machine::new();
        machine
            .spawn(3, |k| {
                k.thread_sleep(&mut Timeout::new(12), SleepFlags::NO_EARLY_WAKE);
            })
            .unwrap();
        assert_eq!(machine.run(), Ok(RunReport { ticks: 12 }));
    }

    #[test]
    fn test_deadlock_detected() {
        let mut machine = Machine::new();
        machine
            .spawn(3, |k| {
                let word = AtomicU32::new(0);
                let _ = k.futex_wait(&mut Timeout::unlimited(), &word, 0);
            })
            .unwrap();
        assert_eq!(
            machine.run(),
            Err(SimError::Deadlock {
                ticks: 0,
                blocked: 1
            })
        );
    }

    #[test]
    fn test_tick_limit() {
        let mut machine = Machine::new().with_tick_limit(5);
        machine
            .spawn(3, |k| {
                k.thread_sleep(&mut Timeout::new(100), SleepFlags::NO_EARLY_WAKE);
            })
            .unwrap();
        assert_eq!(machine.run(), Err(SimError::TickLimit(5)));
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_thread_panic_is_reraised() {
        let mut machine = Machine::new();
        machine.spawn(3, |_| panic!("boom")).unwrap();
        let _ = machine.run();
    }

    #[test]
    fn test_interrupts_restored_after_calls() {
        let mut machine = Machine::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        machine
            .spawn(3, move |k| {
                k.thread_yield();
                *s.lock().unwrap() = Some(k.platform().interrupts_enabled());
            })
            .unwrap();
        machine.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_revoke_word() {
        let platform = SimPlatform::new();
        let word = AtomicU32::new(0);
        assert!(platform.is_live(word_key(&word)));
        platform.revoke_word(&word);
        assert!(!platform.is_live(word_key(&word)));
    }
}
