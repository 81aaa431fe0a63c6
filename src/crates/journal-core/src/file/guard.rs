//! Exclusive access to objects borrowed from a file's mapped windows.
//!
//! Mapping a new window may unmap an old one, so a slice handed out for one
//! object must be dropped before the next object is looked up. [`GuardedCell`]
//! owns the window manager and a flag; [`ValueGuard`] raises the flag for as
//! long as the borrowed object lives.

use crate::error::{JournalError, Result};
use std::cell::{Cell, UnsafeCell};
use std::num::NonZeroU64;
use std::ops::{Deref, DerefMut};

pub struct GuardedCell<T> {
    value: UnsafeCell<T>,
    in_use: Cell<bool>,
}

impl<T> GuardedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            in_use: Cell::new(false),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.get()
    }

    /// Runs `f` with exclusive access to the inner value and ties its result
    /// to a guard. Fails with [`JournalError::ValueGuardInUse`] while an
    /// earlier guard is alive.
    pub fn with_guarded<'a, R, F>(&'a self, offset: NonZeroU64, f: F) -> Result<ValueGuard<'a, R>>
    where
        F: FnOnce(&'a mut T) -> Result<R>,
    {
        if self.in_use.get() {
            return Err(JournalError::ValueGuardInUse);
        }

        // SAFETY: the flag is clear, so no reference derived from an earlier
        // call is alive. It stays raised until the returned guard drops.
        let value = unsafe { &mut *self.value.get() };
        let result = f(value)?;

        self.in_use.set(true);
        Ok(ValueGuard {
            offset,
            value: result,
            in_use: &self.in_use,
        })
    }

    /// Runs `f` with exclusive access to the inner value without handing out
    /// anything that outlives the call.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        if self.in_use.get() {
            return Err(JournalError::ValueGuardInUse);
        }

        // SAFETY: as above; nothing borrowed from the value escapes `f`.
        let value = unsafe { &mut *self.value.get() };
        Ok(f(value))
    }
}

/// An object borrowed from a mapped window, along with its file offset.
#[derive(Debug)]
pub struct ValueGuard<'a, T> {
    offset: NonZeroU64,
    value: T,
    in_use: &'a Cell<bool>,
}

impl<T> ValueGuard<'_, T> {
    pub fn offset(&self) -> NonZeroU64 {
        self.offset
    }
}

impl<T> Deref for ValueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for ValueGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T> Drop for ValueGuard<'_, T> {
    fn drop(&mut self) {
        self.in_use.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    #[test]
    fn second_borrow_fails_until_first_is_dropped() {
        let cell = GuardedCell::new(vec![1u8, 2, 3, 4]);

        let first = cell
            .with_guarded(offset(8), |v| Ok(&v[..2]))
            .unwrap();
        assert_eq!(*first, &[1, 2]);
        assert_eq!(first.offset().get(), 8);

        assert!(matches!(
            cell.with_guarded(offset(16), |v| Ok(&v[2..])),
            Err(JournalError::ValueGuardInUse)
        ));
        assert!(cell.with(|v| v.len()).is_err());

        drop(first);
        let second = cell.with_guarded(offset(16), |v| Ok(&v[2..])).unwrap();
        assert_eq!(*second, &[3, 4]);
    }

    #[test]
    fn failed_closure_leaves_flag_clear() {
        let cell = GuardedCell::new(0u32);
        let result: Result<ValueGuard<'_, ()>> =
            cell.with_guarded(offset(8), |_| Err(JournalError::InvalidOffset));
        assert!(result.is_err());
        assert!(!cell.is_in_use());
    }
}
