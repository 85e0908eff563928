use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, StateSyncError};

/// Locked view of a shared state value. Dropping the guard releases the lock.
pub type StateGuard<'a, T> = MutexGuard<'a, T>;

struct StateCell<T> {
    value: Mutex<T>,
    new_states: AtomicU32,
}

/// Shared-ownership handle to a replicated state value.
///
/// The application and a send or receive domain hold clones of the same handle
/// and therefore observe the same live instance. The value is freed when the
/// last clone is dropped.
pub struct StateHandle<T> {
    cell: Arc<StateCell<T>>,
}

impl<T> StateHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(StateCell {
                value: Mutex::new(value),
                new_states: AtomicU32::new(0),
            }),
        }
    }

    /// Locks the value for a consistent multi-field read or write.
    pub fn lock(&self) -> Result<StateGuard<'_, T>> {
        self.cell
            .value
            .lock()
            .map_err(|_| StateSyncError::msg("shared state has been poisoned"))
    }

    /// Mutates the value under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    pub fn replace(&self, value: T) -> Result<T> {
        self.update(|current| std::mem::replace(current, value))
    }

    /// Number of updates folded in by the most recent receive tick.
    pub fn new_states(&self) -> u32 {
        self.cell.new_states.load(Ordering::Acquire)
    }

    pub(crate) fn set_new_states(&self, count: u32) {
        self.cell.new_states.store(count, Ordering::Release);
    }

    /// Returns `true` when both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Number of live handles to this instance.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.cell)
    }
}

impl<T: Clone> StateHandle<T> {
    /// Copies the value out under the lock.
    pub fn snapshot(&self) -> Result<T> {
        Ok(self.lock()?.clone())
    }
}

impl<T: Default> Default for StateHandle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Clone for StateHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for StateHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("holders", &self.holders())
            .field("new_states", &self.new_states())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultState, Vec3};

    #[test]
    fn clones_share_one_instance() {
        let handle = StateHandle::<DefaultState>::default();
        let app_view = handle.clone();

        handle
            .update(|state| state.pose.position = Vec3::new(4.0, 5.0, 6.0))
            .unwrap();

        assert!(handle.ptr_eq(&app_view));
        assert_eq!(app_view.snapshot().unwrap().pose.position.y, 5.0);
        assert_eq!(handle.holders(), 2);
    }

    #[test]
    fn replace_returns_previous_value() {
        let handle = StateHandle::new(7u32);
        assert_eq!(handle.replace(9).unwrap(), 7);
        assert_eq!(*handle.lock().unwrap(), 9);
    }
}
