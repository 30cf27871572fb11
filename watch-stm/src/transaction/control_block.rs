use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

#[cfg(test)]
use crate::test::{terminates, terminates_async};

/// A control block for a currently running STM instance.
///
/// STM blocks on all read variables if retry was called.
/// This control block is used to let the vars inform the STM instance.
/// The instance keeps one block for its whole run and re-arms it before
/// every wait, so registrations on vars can be reused across attempts.
///
/// Be careful when using this directly,
/// because you can easily create deadlocks.
pub struct ControlBlock {
    /// This is the handle to the thread, that waits on the control block.
    thread: Thread,

    /// Atomic bool stores if the thread has been blocked yet.
    /// Make sure, that park is repeated if no change has happened.
    blocked: AtomicBool,

    /// Set once the owning transaction has committed or been dropped.
    /// Late wake-ups check it and leave the thread handle alone.
    dead: AtomicBool,

    /// Upper bound on time a thread is parked. This prevents a possible deadlock.
    max_parked_time: Duration,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlock {
    /// Create a new `ControlBlock`.
    pub fn new() -> ControlBlock {
        ControlBlock {
            thread: thread::current(),
            blocked: AtomicBool::new(true),
            dead: AtomicBool::new(false),
            max_parked_time: Duration::from_millis(1000),
        }
    }

    /// Inform the control block that a variable has changed.
    ///
    /// Need to be called from outside of STM.
    pub fn set_changed(&self) {
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        // Only wakeup once per arming.
        if self.blocked.swap(false, Ordering::SeqCst) {
            // wake thread
            self.thread.unpark();
        }
    }

    /// Arm the block for another wait.
    ///
    /// Must happen before the waiter re-checks its read variables. A change
    /// landing after the check then flips the flag and the park falls through.
    pub fn rearm(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    /// Mark the block as dead, so that late wake-ups are ignored.
    pub fn set_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Block until one variable has changed.
    ///
    /// `wait` may immediately return.
    ///
    /// `wait` needs to be called by the STM instance itself.
    pub fn wait(&self) {
        while self.blocked.load(Ordering::SeqCst) {
            // Bounded, so that a missed wake-up cannot hang the process.
            thread::park_timeout(self.max_parked_time);
        }
    }
}
