use std::any::Any;
use std::sync::Arc;

/// Type-erased value as stored inside a variable.
pub type ArcAny = Arc<dyn Any + Send + Sync>;

/// Type-erased change predicate of a custom slot.
///
/// Built inside `TVar::new_custom`, where both arguments can safely be
/// downcast to the variable's value type.
pub type ChangedFn = Arc<dyn Fn(&ArcAny, &ArcAny) -> bool + Send + Sync>;

/// One published state of a variable: the value plus what counts as a change.
///
/// Slots are immutable. A mutation builds a successor with [`Slot::set`] and
/// swaps it in under the variable's lock, so readers always observe a complete
/// state. The kind of slot is fixed when the variable is created and `set`
/// preserves it; the two kinds never mix on one variable.
#[derive(Clone)]
pub enum Slot {
    /// The default representation. Every successor bumps the version and
    /// `changed` compares versions only.
    Versioned {
        value: ArcAny,
        version: u64,
    },

    /// Representation with a user supplied predicate deciding what counts
    /// as a change. No version is kept, the predicate is authoritative.
    Custom {
        value: ArcAny,
        changed: ChangedFn,
    },
}

impl Slot {
    /// A fresh versioned slot, starting at version zero.
    pub fn versioned(value: ArcAny) -> Slot {
        Slot::Versioned { value, version: 0 }
    }

    /// A fresh slot with a custom change predicate.
    pub fn custom(value: ArcAny, changed: ChangedFn) -> Slot {
        Slot::Custom { value, changed }
    }

    /// The stored value.
    pub fn value(&self) -> &ArcAny {
        match self {
            Slot::Versioned { value, .. } | Slot::Custom { value, .. } => value,
        }
    }

    /// Build the successor slot holding `value`.
    pub fn set(&self, value: ArcAny) -> Slot {
        match self {
            Slot::Versioned { version, .. } => Slot::Versioned {
                value,
                version: version + 1,
            },
            Slot::Custom { changed, .. } => Slot::Custom {
                value,
                changed: changed.clone(),
            },
        }
    }

    /// Check whether `other` counts as a mutation relative to `self`.
    ///
    /// Both slots must stem from the same variable.
    pub fn changed(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Versioned { version: a, .. }, Slot::Versioned { version: b, .. }) => a != b,
            (
                Slot::Custom {
                    value: a, changed, ..
                },
                Slot::Custom { value: b, .. },
            ) => changed(a, b),
            _ => unreachable!("slot kinds never mix on one variable"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn eq_predicate<T: Any + PartialEq>() -> ChangedFn {
        Arc::new(|a: &ArcAny, b: &ArcAny| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a != b,
                _ => unreachable!("slot has wrong type"),
            }
        })
    }

    #[test]
    fn versioned_set_bumps_version() {
        let first = Slot::versioned(Arc::new(1));
        let second = first.set(Arc::new(2));

        assert!(first.changed(&second));
        assert!(!first.changed(&first.clone()));
    }

    #[test]
    fn versioned_set_of_equal_value_counts_as_change() {
        let first = Slot::versioned(Arc::new(7));
        let second = first.set(Arc::new(7));

        assert!(first.changed(&second));
    }

    #[test]
    fn custom_set_preserves_predicate() {
        let first = Slot::custom(Arc::new(7), eq_predicate::<i32>());
        let second = first.set(Arc::new(7));
        let third = second.set(Arc::new(8));

        // An equal value is no change, a different one is.
        assert!(!first.changed(&second));
        assert!(first.changed(&third));
    }
}
