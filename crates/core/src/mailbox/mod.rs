//! Single-slot, latest-wins hand-off between a network thread and a tick loop.

use std::sync::{Mutex, MutexGuard};

use crate::{Result, StateSyncError};

/// Value taken out of a [`Mailbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<V> {
    pub value: V,
    /// Sends folded into this delivery since the previous receive. Anything
    /// above one means older values were overwritten before being consumed.
    pub arrivals: u32,
}

#[derive(Debug)]
struct Slot<V> {
    value: Option<V>,
    arrivals: u32,
}

/// Holds at most one pending value. A send replaces any unconsumed value, and
/// the lock is held only long enough to move the value in or out.
#[derive(Debug)]
pub struct Mailbox<V> {
    slot: Mutex<Slot<V>>,
}

impl<V> Mailbox<V> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                arrivals: 0,
            }),
        }
    }

    /// Stores `value`, returning the unconsumed value it replaced, if any.
    pub fn try_send(&self, value: V) -> Result<Option<V>> {
        let mut slot = self.lock()?;
        slot.arrivals = slot.arrivals.saturating_add(1);
        Ok(slot.value.replace(value))
    }

    /// Takes the pending value, leaving the slot empty.
    pub fn try_receive_latest(&self) -> Result<Option<Delivery<V>>> {
        let mut slot = self.lock()?;
        let arrivals = std::mem::take(&mut slot.arrivals);
        Ok(slot.value.take().map(|value| Delivery { value, arrivals }))
    }

    /// Drops any pending value.
    pub fn clear(&self) -> Result<()> {
        let mut slot = self.lock()?;
        slot.value = None;
        slot.arrivals = 0;
        Ok(())
    }

    pub fn is_pending(&self) -> Result<bool> {
        Ok(self.lock()?.value.is_some())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot<V>>> {
        self.slot
            .lock()
            .map_err(|_| StateSyncError::msg("pending update slot has been poisoned"))
    }
}

impl<V> Default for Mailbox<V> {
    fn default() -> Self {
        Self::new()
    }
}
