// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pending totals guarded by one lock per key.
//!
//! The table mutex is held only to look up, insert or unlink a slot, never while a total is being
//! changed, so signals for unrelated keys don't wait on each other.
//!
//! A slot is unlinked when its total goes away. A task can already be holding an `Arc` to that slot
//! and be waiting on its lock; when it gets the lock it must not touch the slot anymore, or two slots
//! would be live for one key and one of them would lose its update. Slots are therefore marked
//! retired (under their own lock) before they are unlinked, and a task that wakes up on a retired
//! slot goes back to the table for the current one.
//!
//! Lock order is slot, then table. Nothing takes a slot lock while holding the table lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use hitcount_core::FlushRecord;

#[derive(Default)]
struct SlotState {
    total: Option<i64>,
    retired: bool,
}

#[derive(Default)]
struct KeySlot {
    state: Mutex<SlotState>,
}

impl KeySlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub(crate) struct KeyLockTable {
    slots: Mutex<HashMap<String, Arc<KeySlot>>>,
}

impl KeyLockTable {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<KeySlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_for(&self, key: &str) -> Arc<KeySlot> {
        Arc::clone(self.slots().entry_ref(key).or_default())
    }

    /// Run `update` on the pending total of `key` while holding the key's lock.
    ///
    /// `None` means the key has no pending total. If `update` leaves it `None`, the key's lock is
    /// removed from the table before this returns.
    pub(crate) fn update<R>(&self, key: &str, update: impl FnOnce(&mut Option<i64>) -> R) -> R {
        loop {
            let slot = self.slot_for(key);
            let mut state = slot.lock();
            if state.retired {
                // unlinked while we waited, the table already holds (or will create) a fresh slot
                continue;
            }
            let result = update(&mut state.total);
            if state.total.is_none() {
                state.retired = true;
                let mut slots = self.slots();
                if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.remove(key);
                }
            }
            return result;
        }
    }

    /// The pending total of `key`, if any
    pub(crate) fn pending(&self, key: &str) -> Option<i64> {
        let slot = self.slots().get(key).cloned()?;
        let state = slot.lock();
        if state.retired { None } else { state.total }
    }

    /// Number of keys with a live lock
    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }

    /// Unlink every slot and return the totals they held.
    pub(crate) fn drain(&self) -> Vec<FlushRecord> {
        let slots = std::mem::take(&mut *self.slots());
        let mut records = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let mut state = slot.lock();
            state.retired = true;
            if let Some(total) = state.total.take() {
                records.push(FlushRecord::new(key, total));
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn add(table: &KeyLockTable, key: &str, delta: i64) {
        table.update(key, |total| {
            let next = total.unwrap_or(0) + delta;
            *total = (next > 0).then_some(next);
        });
    }

    #[test]
    fn removes_lock_when_total_goes_away() {
        let table = KeyLockTable::default();
        add(&table, "a", 3);
        assert_eq!(table.pending("a"), Some(3));
        assert_eq!(table.len(), 1);
        add(&table, "a", -3);
        assert_eq!(table.pending("a"), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn untouched_key_leaves_no_lock_behind() {
        let table = KeyLockTable::default();
        let seen = table.update("ghost", |total| *total);
        assert_eq!(seen, None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drain_takes_everything() {
        let table = KeyLockTable::default();
        add(&table, "a", 1);
        add(&table, "b", 2);
        let mut drained = table.drain();
        drained.sort_by(|l, r| l.key().cmp(r.key()));
        assert_eq!(drained, vec![FlushRecord::new("a", 1), FlushRecord::new("b", 2)]);
        assert_eq!(table.len(), 0);
        assert_eq!(table.pending("a"), None);
    }

    // Every thread adds one and then removes it again, so the running total never goes below
    // zero and every zero unlinks the slot. A stale slot taking an update would strand a total.
    #[test]
    fn churning_key_never_loses_updates() {
        let table = KeyLockTable::default();
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        add(&table, "hot", 1);
                        add(&table, "hot", -1);
                    }
                });
            }
        });
        assert_eq!(table.pending("hot"), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn concurrent_increments_add_up() {
        let table = KeyLockTable::default();
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1_000 {
                        add(&table, "hot", 1);
                    }
                });
            }
        });
        assert_eq!(table.pending("hot"), Some(8_000));
    }
}
