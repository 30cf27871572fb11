use std::any::Any;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;

use crate::result::{StmClosureResult, StmError};
use crate::tvar::{TVar, VarControlBlock};
use crate::{TransactionClosureResult, TransactionControl, TransactionError, TransactionResult};

use super::control_block::ControlBlock;
use super::log_var::LogVar;
use super::TransactionGuard;

/// An operation that can run as (part of) a transaction.
///
/// This is the boxed form used by the `select` and `compose` combinators,
/// where a homogeneous list of operations is needed.
pub type Op<'a, T> = Box<dyn Fn(&mut Transaction) -> StmClosureResult<T> + 'a>;

/// Check whether an operation would block, without running a real transaction.
///
/// The operation runs against a scratch log. Nothing is committed, no watcher
/// is installed on any var and no shared state is touched; all work is
/// discarded.
///
/// ```
/// # use watch_stm::*;
/// assert!(would_block(|_| -> StmClosureResult<i32> { retry() }));
/// assert!(!would_block(|_| Ok(42)));
/// ```
pub fn would_block<T, F>(f: F) -> bool
where
    F: Fn(&mut Transaction) -> StmClosureResult<T>,
{
    let _guard = TransactionGuard::new();
    let mut transaction = Transaction::new();
    matches!(f(&mut transaction), Err(StmError::Retry))
}

/// Transaction tracks all the read and written variables.
///
/// It is used for checking vars, to ensure atomicity.
pub struct Transaction {
    /// Map of all vars that map the `VarControlBlock` of a var to a `LogVar`.
    /// The `VarControlBlock` is unique because it uses it's address for comparing.
    ///
    /// The logs need to be accessed in a order to prevend dead-locks on locking.
    vars: BTreeMap<Arc<VarControlBlock>, LogVar>,

    /// Vars that currently hold this transaction's waiter handle.
    ///
    /// Kept across attempts, so that repeated waits on the same vars reuse
    /// their registrations instead of churning on the watcher lists.
    watching: BTreeSet<Arc<VarControlBlock>>,

    /// Waiter handle, created on the first wait and reused afterwards.
    ctrl: Option<Arc<ControlBlock>>,

    /// Number of attempts this transaction has started, including the
    /// current one.
    tries: u64,
}

impl Transaction {
    /// Create a new log.
    ///
    /// Normally you don't need to call this directly.
    /// Use `atomically` instead.
    fn new() -> Transaction {
        Transaction {
            vars: BTreeMap::new(),
            watching: BTreeSet::new(),
            ctrl: None,
            tries: 0,
        }
    }

    /// Run a function with a transaction.
    ///
    /// It is equivalent to `atomically`.
    pub fn with<T, F>(f: F) -> T
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        match Transaction::with_control(|_| TransactionControl::Retry, f) {
            Some(t) => t,
            None => unreachable!(),
        }
    }

    /// Run a function with a transaction.
    ///
    /// `with_control` takes another control function, that
    /// can steer the control flow and possible terminate early.
    ///
    /// `control` can react to counters, timeouts or external inputs.
    ///
    /// It allows the user to fall back to another strategy, like a global lock
    /// in the case of too much contention.
    ///
    /// Please note, that the transaction may still infinitely wait for changes when `retry` is
    /// called and `control` does not abort.
    /// If you need a timeout, another thread should signal this through a [`TVar`].
    pub fn with_control<T, F, C>(mut control: C, f: F) -> Option<T>
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();

        // create a log guard for initializing and cleaning up
        // the log
        let mut transaction = Transaction::new();

        // loop until success
        loop {
            transaction.tries += 1;

            // run the computation
            match f(&mut transaction) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        return Some(t);
                    }
                }

                Err(e) => {
                    // Check if the user wants to abort the transaction.
                    if let TransactionControl::Abort = control(e) {
                        return None;
                    }

                    // on retry wait for changes
                    if let StmError::Retry = e {
                        transaction.wait_for_change();
                    }
                }
            }

            // clear log before retrying computation
            transaction.clear();
        }
    }

    /// Run a function with a transaction.
    ///
    /// The transaction will be retried until it validates, or until it is
    /// explicitly aborted from the function with `abort`.
    pub fn with_err<T, F, E>(f: F) -> Result<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        let _guard = TransactionGuard::new();

        // create a log guard for initializing and cleaning up
        // the log
        let mut transaction = Transaction::new();

        // loop until success
        loop {
            transaction.tries += 1;

            // run the computation
            match f(&mut transaction) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        return Ok(t);
                    }
                }
                // on error,
                Err(e) => match e {
                    // abort and return the error
                    TransactionError::Abort(err) => return Err(err),
                    // retry
                    TransactionError::Stm(e) => {
                        if let StmError::Retry = e {
                            transaction.wait_for_change();
                        }
                    }
                },
            }

            // clear log before retrying computation
            transaction.clear();
        }
    }

    /// Run a function with a transaction.
    ///
    /// Combination of `with_control` and `with_err`: the control function can
    /// abandon the transaction and the closure can cancel it with an error.
    pub fn with_control_and_err<T, F, C, E>(mut control: C, f: F) -> TransactionResult<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();

        // create a log guard for initializing and cleaning up
        // the log
        let mut transaction = Transaction::new();

        // loop until success
        loop {
            transaction.tries += 1;

            // run the computation
            match f(&mut transaction) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        return TransactionResult::Validated(t);
                    }
                }

                Err(e) => match e {
                    TransactionError::Abort(err) => {
                        return TransactionResult::Cancelled(err);
                    }
                    TransactionError::Stm(err) => {
                        // Check if the user wants to abort the transaction.
                        if let TransactionControl::Abort = control(err) {
                            return TransactionResult::Abandoned;
                        }

                        // on retry wait for changes
                        if let StmError::Retry = err {
                            transaction.wait_for_change();
                        }
                    }
                },
            }

            // clear log before retrying computation
            transaction.clear();
        }
    }

    /// Number of attempts this transaction has started, including the
    /// current one.
    ///
    /// Usable from inside an operation, e.g. to give up through
    /// `with_control` under heavy contention.
    pub fn tries(&self) -> u64 {
        self.tries
    }

    #[allow(clippy::needless_pass_by_value)]
    /// Perform a downcast on a var.
    fn downcast<T: Any + Clone>(var: Arc<dyn Any>) -> T {
        match var.downcast_ref::<T>() {
            Some(s) => s.clone(),
            None => unreachable!("TVar has wrong type"),
        }
    }

    /// Read a variable and return the value.
    ///
    /// The returned value is not always consistent with the current value of the var,
    /// but may be an outdated or or not yet commited value.
    ///
    /// The used code should be capable of handling inconsistent states
    /// without running into infinite loops.
    /// Just the commit of wrong values is prevented by STM.
    pub fn read<T: Send + Sync + Any + Clone>(&mut self, var: &TVar<T>) -> StmClosureResult<T> {
        let ctrl = var.control_block().clone();
        // Check if the same var was accessed before.
        let value = match self.vars.entry(ctrl) {
            // If the variable has been accessed before, then load that value.
            #[cfg(feature = "early-conflict-detection")]
            Entry::Occupied(mut entry) => {
                let log = entry.get_mut();
                // if we previously read the var, check whether it changed since
                if let LogVar::Read(witness) = log {
                    let current = var.control_block().value.read();
                    if witness.changed(&current) {
                        return Err(StmError::Failure);
                    }
                }
                log.read()
            }
            #[cfg(not(feature = "early-conflict-detection"))]
            Entry::Occupied(mut entry) => entry.get_mut().read(),

            // Else load the variable statically.
            Entry::Vacant(entry) => {
                // Read the current slot from the var; it is the witness
                // validated at commit.
                let slot = var.control_block().value.read().clone();
                let value = slot.value().clone();

                entry.insert(LogVar::Read(slot));
                value
            }
        };

        Ok(Transaction::downcast(value))
    }

    /// Write a variable.
    ///
    /// The write is not immediately visible to other threads,
    /// but atomically commited at the end of the computation.
    pub fn write<T: Any + Send + Sync + Clone>(
        &mut self,
        var: &TVar<T>,
        value: T,
    ) -> StmClosureResult<()> {
        // box the value
        let boxed: Arc<dyn Any + Send + Sync> = Arc::new(value);

        // new control block
        let ctrl = var.control_block().clone();
        // update or create new entry
        match self.vars.entry(ctrl) {
            Entry::Occupied(mut entry) => entry.get_mut().write(boxed),
            Entry::Vacant(entry) => {
                entry.insert(LogVar::Write(boxed));
            }
        }

        // For now always succeeds, but that may change later.
        Ok(())
    }

    /// Combine two calculations. When one blocks with `retry`,
    /// run the other, but don't commit the changes in the first.
    ///
    /// If both block, `Transaction::or` still waits for `TVar`s in both functions.
    /// Use `Transaction::or` instead of handling errors directly with the `Result::or`.
    /// The later does not handle all the blocking correctly.
    pub fn or<T, F1, F2>(&mut self, first: F1, second: F2) -> StmClosureResult<T>
    where
        F1: Fn(&mut Transaction) -> StmClosureResult<T>,
        F2: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        // Create a backup of the log. The waiter state stays with self.
        let mut backup = self.vars.clone();

        // Run the first computation.
        let f = first(self);

        match f {
            // Run other on manual retry call.
            Err(StmError::Retry) => {
                // swap, so that self runs on the log from before the first branch
                mem::swap(&mut self.vars, &mut backup);

                // Run other action.
                let s = second(self);

                // If both called retry then exit.
                match s {
                    Err(StmError::Failure) => Err(StmError::Failure),
                    s => {
                        self.combine(backup);
                        s
                    }
                }
            }

            // Return success and failure directly
            x => x,
        }
    }

    /// Run the given operations in order until the first one that does not
    /// retry; its value is returned and its effects are the ones committed.
    ///
    /// An empty list is the blocking identity: it retries, so
    /// `atomically(select(vec![]))` blocks forever. The writes of a branch
    /// that retried are discarded before the next branch runs, while its
    /// reads stay part of the wait set.
    pub fn select<T>(&mut self, ops: &[Op<'_, T>]) -> StmClosureResult<T> {
        match ops {
            [] => Err(StmError::Retry),
            [single] => single(self),
            [first, rest @ ..] => self.or(|tx| first(tx), |tx| tx.select(rest)),
        }
    }

    /// Combine the branch of an abandoned path into the log, to allow waiting
    /// for all reads.
    fn combine(&mut self, branch: BTreeMap<Arc<VarControlBlock>, LogVar>) {
        // combine reads
        for (var, value) in branch {
            // only insert new values
            if let Some(value) = value.obsolete() {
                self.vars.entry(var).or_insert(value);
            }
        }
    }

    /// Clear the log's data.
    ///
    /// This should be used before redoing a computation, but
    /// nowhere else. The waiter state survives, so watcher registrations
    /// can be reused by the next attempt.
    fn clear(&mut self) {
        self.vars.clear();
    }

    /// Wait for any read variable to change,
    /// because the change may lead to a new calculation result.
    fn wait_for_change(&mut self) {
        // One waiter handle is kept for the whole transaction, so that
        // registrations survive across attempts.
        let ctrl = self
            .ctrl
            .get_or_insert_with(|| Arc::new(ControlBlock::new()))
            .clone();

        // Arm before checking consistency. A change landing after the check
        // flips the flag and the park below falls through.
        ctrl.rearm();

        // Collect the read vars with their witnesses; writes don't block.
        let vars = mem::take(&mut self.vars);
        let mut reads = Vec::with_capacity(vars.len());
        for (var, log_var) in vars {
            if let Some(witness) = log_var.into_read_slot() {
                reads.push((var, witness));
            }
        }

        // Reconcile the watcher registrations with this attempt's read set.
        let read_set: BTreeSet<Arc<VarControlBlock>> =
            reads.iter().map(|(var, _)| var.clone()).collect();
        let stale: Vec<Arc<VarControlBlock>> =
            self.watching.difference(&read_set).cloned().collect();
        for var in stale {
            var.unwatch(&ctrl);
            self.watching.remove(&var);
        }
        for var in &read_set {
            if self.watching.insert(var.clone()) {
                var.watch(&ctrl);
            }
        }

        // Check for consistency.
        let blocking = reads.iter().all(|(var, witness)| {
            // Take read lock and compare with the witness.
            let guard = var.value.read();
            !witness.changed(&guard)
        });

        // If no var has changed yet, then block.
        if blocking {
            // Probably wait until one var has changed.
            ctrl.wait();
        }
    }

    /// Write the log back to the variables.
    ///
    /// Return true for success and false, if a read var has changed
    fn commit(&mut self) -> bool {
        // Use two phase locking for safely writing data back to the vars.

        // First phase: acquire locks in map (i.e. address) order.
        // Check for consistency of all the reads and perform
        // an early return if something is not consistent.

        // vector of read locks.
        let mut read_vec = Vec::with_capacity(self.vars.len());

        // vector of tuple (value, lock)
        let mut write_vec = Vec::with_capacity(self.vars.len());

        // vector of written variables
        let mut written = Vec::with_capacity(self.vars.len());

        for (var, value) in &self.vars {
            // lock the variable and read the value

            match *value {
                // We need to take a write lock.
                LogVar::Write(ref w) | LogVar::ReadObsoleteWrite(_, ref w) => {
                    // take write lock
                    let lock = var.value.write();
                    // add all data to the vector
                    write_vec.push((w, lock));
                    written.push(var);
                }

                // We need to check for consistency and
                // take a write lock.
                LogVar::ReadWrite(ref witness, ref w) => {
                    // take write lock
                    let lock = var.value.write();

                    if witness.changed(&lock) {
                        return false;
                    }
                    // add all data to the vector
                    write_vec.push((w, lock));
                    written.push(var);
                }
                // Nothing to do. ReadObsolete is only needed for blocking, not
                // for consistency checks.
                LogVar::ReadObsolete(_) => {}
                // Take read lock and check for consistency.
                LogVar::Read(ref witness) => {
                    // Take a read lock.
                    let lock = var.value.read();

                    if witness.changed(&lock) {
                        return false;
                    }

                    read_vec.push(lock);
                }
            }
        }

        // Second phase: write back and release

        // Release the reads first.
        // This allows other threads to continue quickly.
        drop(read_vec);

        for (value, mut lock) in write_vec {
            // Build and publish the successor slot; versions only advance.
            let next = lock.set(value.clone());
            *lock = next;
        }

        for var in written {
            // Unblock all threads waiting for it.
            var.wake_all();
        }

        // Commit succeded.
        true
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A committed or abandoned transaction must not be woken any more.
        if let Some(ctrl) = self.ctrl.take() {
            ctrl.set_dead();
            for var in &self.watching {
                var.unwatch(&ctrl);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{guard, retry};

    #[test]
    fn read() {
        let mut log = Transaction::new();
        let var = TVar::new(vec![1, 2, 3, 4]);

        // The variable can be read.
        assert_eq!(&*log.read(&var).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn write_read() {
        let mut log = Transaction::new();
        let var = TVar::new(vec![1, 2]);

        log.write(&var, vec![1, 2, 3, 4]).unwrap();

        // Consecutive reads get the updated version.
        assert_eq!(log.read(&var).unwrap(), [1, 2, 3, 4]);

        // The original value is still preserved.
        assert_eq!(var.read_atomic(), [1, 2]);
    }

    #[test]
    fn transaction_simple() {
        let x = Transaction::with(|_| Ok(42));
        assert_eq!(x, 42);
    }

    #[test]
    fn transaction_read() {
        let read = TVar::new(42);

        let x = Transaction::with(|trans| read.read(trans));

        assert_eq!(x, 42);
    }

    /// Run a transaction with a control function, that always aborts.
    /// The transaction still tries to run a single time and should successfully
    /// commit in this test.
    #[test]
    fn transaction_with_control_abort_on_single_run() {
        let read = TVar::new(42);

        let x = Transaction::with_control(|_| TransactionControl::Abort, |tx| read.read(tx));

        assert_eq!(x, Some(42));
    }

    /// Run a transaction with a control function, that always aborts.
    /// The transaction retries infinitely often. The control function will abort this loop.
    #[test]
    fn transaction_with_control_abort_on_retry() {
        let x: Option<i32> =
            Transaction::with_control(|_| TransactionControl::Abort, |_| Err(StmError::Retry));

        assert_eq!(x, None);
    }

    #[test]
    fn transaction_write() {
        let write = TVar::new(42);

        Transaction::with(|trans| write.write(trans, 0));

        assert_eq!(write.read_atomic(), 0);
    }

    #[test]
    fn transaction_copy() {
        let read = TVar::new(42);
        let write = TVar::new(0);

        Transaction::with(|trans| {
            let r = read.read(trans)?;
            write.write(trans, r)
        });

        assert_eq!(write.read_atomic(), 42);
    }

    /// The attempt counter is visible from inside the operation.
    #[test]
    fn transaction_tries() {
        let x = Transaction::with(|tx| Ok(tx.tries()));

        assert_eq!(x, 1);
    }

    /// The control function can abandon a transaction that keeps retrying,
    /// and an abort from the closure is surfaced as cancellation.
    #[test]
    fn with_control_and_err_outcomes() {
        let x: TransactionResult<i32, &str> = Transaction::with_control_and_err(
            |_| TransactionControl::Abort,
            |_| Err(TransactionError::Stm(StmError::Retry)),
        );
        assert_eq!(x, TransactionResult::Abandoned);

        let x: TransactionResult<i32, &str> = Transaction::with_control_and_err(
            |_| TransactionControl::Retry,
            |_| Err(TransactionError::Abort("cancelled")),
        );
        assert_eq!(x, TransactionResult::Cancelled("cancelled"));
    }

    /// Selecting from no operations retries.
    #[test]
    fn select_empty_retries() {
        let mut log = Transaction::new();
        let ops: Vec<Op<'_, i32>> = Vec::new();

        assert_eq!(log.select(&ops), Err(StmError::Retry));
    }

    /// A single operation select behaves like the operation itself.
    #[test]
    fn select_single() {
        let var = TVar::new(42);
        let ops: Vec<Op<'_, i32>> = vec![Box::new(|tx| var.read(tx))];

        let x = Transaction::with(|tx| tx.select(&ops));

        assert_eq!(x, 42);
    }

    /// The first branch that does not retry wins, in order.
    #[test]
    fn select_left_biased() {
        let ops: Vec<Op<'_, i32>> = vec![
            Box::new(|_| retry()),
            Box::new(|_| Ok(2)),
            Box::new(|_| Ok(3)),
        ];

        let x = Transaction::with(|tx| tx.select(&ops));

        assert_eq!(x, 2);
    }

    /// Writes of a retried branch never reach later branches or the vars.
    #[test]
    fn select_write_isolation() {
        let var = TVar::new(42);
        let a = var.clone();
        let b = var.clone();
        let ops: Vec<Op<'_, i32>> = vec![
            Box::new(move |tx| {
                a.write(tx, 23)?;
                retry()
            }),
            Box::new(move |tx| b.read(tx)),
        ];

        let x = Transaction::with(|tx| tx.select(&ops));

        assert_eq!(x, 42);
        assert_eq!(var.read_atomic(), 42);
    }

    /// A waiting transaction commits on the first attempt when a concurrent
    /// write does not count as a change under the custom predicate.
    #[test]
    fn custom_eq_write_does_not_invalidate() {
        use std::cell::Cell;
        use std::sync::mpsc::channel;
        use std::thread;

        let x = TVar::new_builtin_eq(7);
        let y = TVar::new(0);
        let xc = x.clone();

        let (request, serve) = channel();
        let (ack, acked) = channel();
        let writer = thread::spawn(move || {
            serve.recv().unwrap();
            // same value, no change under the eq predicate
            xc.write_atomic(7);
            ack.send(()).unwrap();
        });

        let attempts = Cell::new(0_u32);
        Transaction::with(|tx| {
            attempts.set(attempts.get() + 1);
            let v = x.read(tx)?;
            if attempts.get() == 1 {
                request.send(()).unwrap();
                acked.recv().unwrap();
            }
            y.write(tx, v)
        });

        writer.join().unwrap();
        assert_eq!(attempts.get(), 1);
        assert_eq!(y.read_atomic(), 7);
    }

    /// The same interleaving on a default versioned var restarts the reader.
    #[test]
    fn versioned_write_invalidates() {
        use std::cell::Cell;
        use std::sync::mpsc::channel;
        use std::thread;

        let x = TVar::new(7);
        let xc = x.clone();

        let (request, serve) = channel();
        let (ack, acked) = channel();
        let writer = thread::spawn(move || {
            serve.recv().unwrap();
            xc.write_atomic(7);
            ack.send(()).unwrap();
        });

        let attempts = Cell::new(0_u32);
        Transaction::with(|tx| {
            attempts.set(attempts.get() + 1);
            let _ = x.read(tx)?;
            if attempts.get() == 1 {
                request.send(()).unwrap();
                acked.recv().unwrap();
            }
            Ok(())
        });

        writer.join().unwrap();
        assert_eq!(attempts.get(), 2);
    }

    /// A blocked empty transaction does not register any watcher, but a
    /// blocked read does, and the registration is dropped afterwards.
    #[test]
    fn watcher_registrations_are_cleaned_up() {
        use std::thread;
        use std::time::Duration;

        let x = TVar::new(0);
        let xc = x.clone();

        let waiter = thread::spawn(move || {
            Transaction::with(|tx| guard(xc.read(tx)? == 42))
        });

        thread::sleep(Duration::from_millis(100));
        x.write_atomic(42);
        waiter.join().unwrap();

        // The waiter has committed; its registration is gone.
        assert!(x.control_block().value.read().value().downcast_ref::<i32>() == Some(&42));
        x.write_atomic(43); // waking nobody must not blow up
    }

    /// Test if nested transactions are correctly detected.
    #[test]
    #[should_panic]
    fn transaction_nested_fail() {
        Transaction::with(|_| {
            Transaction::with(|_| Ok(42));
            Ok(1)
        });
    }
}
