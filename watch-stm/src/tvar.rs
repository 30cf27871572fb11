// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cmp;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::result::StmClosureResult;
use crate::slot::{ArcAny, ChangedFn, Slot};
use crate::transaction::control_block::ControlBlock;
use crate::Transaction;

/// `VarControlBlock` contains all the useful data for a `Var` while beeing the same type.
///
/// The control block is accessed from other threads directly whereas `Var`
/// is just a typesafe wrapper around it.
pub struct VarControlBlock {
    /// Waiter handles of transactions currently blocked on this var.
    ///
    /// Registering the same handle twice has no effect. A handle stays
    /// registered until its transaction commits or stops reading the var,
    /// so successive waits on the same var reuse the registration.
    waiting: Mutex<Vec<Arc<ControlBlock>>>,

    /// The currently published slot of the var.
    ///
    /// The write side of the lock is the var's commit lock. It is held only
    /// while a commit validates and publishes this var, never on the plain
    /// read path. Readers take the read side briefly to clone the slot, so
    /// they always observe a complete slot.
    pub value: RwLock<Slot>,
}

impl VarControlBlock {
    /// create a new `VarControlBlock` holding `slot`
    pub fn new(slot: Slot) -> Arc<VarControlBlock> {
        Arc::new(VarControlBlock {
            waiting: Mutex::new(Vec::new()),
            value: RwLock::new(slot),
        })
    }

    /// Register a waiter handle on this var.
    ///
    /// Idempotent per handle.
    pub fn watch(&self, ctrl: &Arc<ControlBlock>) {
        let mut waiting = self.waiting.lock();
        if !waiting.iter().any(|w| Arc::ptr_eq(w, ctrl)) {
            waiting.push(ctrl.clone());
        }
    }

    /// Drop a waiter handle registered with `watch`.
    pub fn unwatch(&self, ctrl: &Arc<ControlBlock>) {
        self.waiting.lock().retain(|w| !Arc::ptr_eq(w, ctrl));
    }

    /// Wake all transactions waiting on this var.
    ///
    /// Called after a new slot has been published. The waiting list is locked
    /// for the whole iteration, so concurrent watch/unwatch calls cannot
    /// invalidate it.
    pub fn wake_all(&self) {
        let waiting = self.waiting.lock();
        for ctrl in waiting.iter() {
            ctrl.set_changed();
        }
    }

    fn get_address(&self) -> usize {
        std::ptr::from_ref::<VarControlBlock>(self) as usize
    }
}

// Implement some operators so that VarControlBlocks can be sorted.

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.get_address() == other.get_address()
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.get_address().cmp(&other.get_address())
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A variable that can be used in a STM-Block
#[derive(Clone)]
pub struct TVar<T> {
    /// The control block is the inner of the variable.
    ///
    /// The rest of `TVar` is just the typesafe interface.
    control_block: Arc<VarControlBlock>,

    /// This marker is needed so that the variable can be used in a typesafe
    /// manner.
    _marker: PhantomData<T>,
}

impl<T> TVar<T>
where
    T: Any + Sync + Send + Clone,
{
    /// Create a new `TVar` with the default versioned slot.
    ///
    /// Every write to the var counts as a change, even a write of an equal
    /// value, because the slot version advances.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(Slot::versioned(Arc::new(val))),
            _marker: PhantomData,
        }
    }

    /// Create a new `TVar` with a custom change predicate.
    ///
    /// `changed(old, new)` decides what counts as a mutation for read
    /// validation and for waking blocked transactions. Writes for which the
    /// predicate returns false do not invalidate readers and do not satisfy
    /// waiters.
    ///
    /// ```
    /// # use watch_stm::*;
    /// // Treat values as unchanged when their first element is equal.
    /// let var = TVar::new_custom(vec![1, 2], |a: &Vec<i32>, b: &Vec<i32>| a[0] != b[0]);
    ///
    /// var.write_atomic(vec![1, 3]);
    /// ```
    pub fn new_custom<F>(val: T, changed: F) -> TVar<T>
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let changed: ChangedFn = Arc::new(move |a: &ArcAny, b: &ArcAny| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => changed(a, b),
                _ => unreachable!("TVar has wrong type"),
            }
        });
        TVar {
            control_block: VarControlBlock::new(Slot::custom(Arc::new(val), changed)),
            _marker: PhantomData,
        }
    }

    /// Create a new `TVar` that compares values with `!=`.
    ///
    /// Writing a value equal to the current one is not a change: it neither
    /// invalidates readers nor wakes waiters.
    pub fn new_builtin_eq(val: T) -> TVar<T>
    where
        T: PartialEq,
    {
        TVar::new_custom(val, |a, b| a != b)
    }

    #[allow(clippy::missing_panics_doc)]
    /// `read_atomic` reads a value atomically, without starting a transaction.
    ///
    /// It is semantically equivalent to
    ///
    /// ```
    /// # use watch_stm::*;
    ///
    /// let var = TVar::new(0);
    /// atomically(|trans| var.read(trans));
    /// ```
    ///
    /// but more efficient.
    ///
    /// `read_atomic` returns a clone of the value.
    pub fn read_atomic(&self) -> T {
        let val = self.read_ref_atomic();

        (&*val as &dyn Any)
            .downcast_ref::<T>()
            .expect("wrong type in TVar<T>")
            .clone()
    }

    /// Read a value atomically but return a reference.
    ///
    /// This is mostly used internally, but can be useful in
    /// some cases, because `read_atomic` clones the
    /// inner value, which may be expensive.
    pub fn read_ref_atomic(&self) -> ArcAny {
        self.control_block.value.read().value().clone()
    }

    /// `write_atomic` publishes a value without starting a transaction.
    ///
    /// It takes the var's commit lock, installs the successor slot and wakes
    /// all watchers. It is semantically equivalent to a transaction with a
    /// single write, which can never fail validation.
    ///
    /// ```
    /// # use watch_stm::*;
    ///
    /// let var = TVar::new(0);
    /// var.write_atomic(42);
    ///
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn write_atomic(&self, value: T) {
        let boxed: ArcAny = Arc::new(value);
        {
            let mut slot = self.control_block.value.write();
            let next = slot.set(boxed);
            *slot = next;
        }
        self.control_block.wake_all();
    }

    /// The normal way to access a var.
    ///
    /// It is equivalent to `transaction.read(&var)`, but more
    /// convenient.
    pub fn read(&self, transaction: &mut Transaction) -> StmClosureResult<T> {
        transaction.read(self)
    }

    /// The normal way to write a var.
    ///
    /// It is equivalent to `transaction.write(&var, value)`, but more
    /// convenient.
    pub fn write(&self, transaction: &mut Transaction, value: T) -> StmClosureResult<()> {
        transaction.write(self, value)
    }

    /// Modify the content of a `TVar` with the function f.
    ///
    /// ```
    /// # use watch_stm::*;
    ///
    ///
    /// let var = TVar::new(21);
    /// atomically(|trans|
    ///     var.modify(trans, |x| x*2)
    /// );
    ///
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn modify<F>(&self, transaction: &mut Transaction, f: F) -> StmClosureResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.read(transaction)?;
        self.write(transaction, f(old))
    }

    /// Replaces the value of a `TVar` with a new one, returning
    /// the old one.
    ///
    /// ```
    /// # use watch_stm::*;
    ///
    /// let var = TVar::new(0);
    /// let x = atomically(|trans|
    ///     var.replace(trans, 42)
    /// );
    ///
    /// assert_eq!(x, 0);
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn replace(&self, transaction: &mut Transaction, value: T) -> StmClosureResult<T> {
        let old = self.read(transaction)?;
        self.write(transaction, value)?;
        Ok(old)
    }

    /// Check if two `TVar`s refer to the same position.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Access the control block of the var.
    ///
    /// Internal use only!
    pub fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }
}

/// Debug output a struct.
///
/// Note that this function does not print the state atomically.
/// If another thread modifies the datastructure at the same time, it may print an inconsistent state.
/// If you need an accurate view, that reflects current thread-local state, you can implement it easily yourself with
/// atomically.
///
/// Running `atomically` inside a running transaction panics. Therefore `fmt` uses
/// prints the state.
impl<T> Debug for TVar<T>
where
    T: Any + Sync + Send + Clone,
    T: Debug,
{
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let x = self.read_atomic();
        f.debug_struct("TVar").field("value", &x).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Test if creating and reading a TVar works.
    #[test]
    fn read_atomic() {
        let var = TVar::new(42);

        assert_eq!(42, var.read_atomic());
    }

    #[test]
    fn write_atomic() {
        let var = TVar::new(0);

        var.write_atomic(42);

        assert_eq!(42, var.read_atomic());
    }

    #[test]
    fn write_atomic_bumps_version() {
        let var = TVar::new(0);
        let before = var.control_block().value.read().clone();

        var.write_atomic(0);

        let after = var.control_block().value.read();
        assert!(before.changed(&after));
    }

    #[test]
    fn builtin_eq_equal_write_is_no_change() {
        let var = TVar::new_builtin_eq(7);
        let before = var.control_block().value.read().clone();

        var.write_atomic(7);

        let after = var.control_block().value.read();
        assert!(!before.changed(&after));
    }
}

// More tests are in lib.rs.
