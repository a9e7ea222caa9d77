//! Host-wide admission: box slots and reserved memory behind one FIFO gate.

use crate::error::CapacityError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Box id owned by a slot. Ids are stable so a torn-down box is reused by
/// the next job admitted to the same slot.
pub fn box_id(slot: usize) -> String {
    format!("box-{}", slot)
}

pub struct Capacity {
    /// Fair mutex: waiters are admitted strictly in arrival order
    gate: tokio::sync::Mutex<()>,
    slots: Arc<Semaphore>,
    free_slots: Mutex<BTreeSet<usize>>,
    reserved_memory: AtomicU64,
    memory_budget: u64,
    released: Notify,
    ceiling: usize,
    retired: AtomicUsize,
    closed: AtomicBool,
}

impl Capacity {
    pub fn new(ceiling: usize, memory_budget: u64) -> Arc<Self> {
        Arc::new(Self {
            gate: tokio::sync::Mutex::new(()),
            slots: Arc::new(Semaphore::new(ceiling)),
            free_slots: Mutex::new((0..ceiling).collect()),
            reserved_memory: AtomicU64::new(0),
            memory_budget,
            released: Notify::new(),
            ceiling,
            retired: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Boxes currently admitted.
    pub fn active(&self) -> usize {
        self.ceiling - self.retired.load(Ordering::SeqCst) - self.slots.available_permits()
    }

    pub fn reserved_memory(&self) -> u64 {
        self.reserved_memory.load(Ordering::SeqCst)
    }

    /// Wait for a slot and `memory` bytes of budget. A request larger than
    /// the whole budget can never be served and fails immediately.
    pub async fn admit(self: &Arc<Self>, memory: u64) -> Result<Admission, CapacityError> {
        if memory > self.memory_budget {
            return Err(CapacityError::HardCeiling {
                requested: memory,
                budget: self.memory_budget,
            });
        }

        let _turn = self.gate.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CapacityError::Closed);
        }

        // Retiring the last live slot must wake a waiter parked on the semaphore
        let permit = loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.retired.load(Ordering::SeqCst) >= self.ceiling {
                return Err(CapacityError::Exhausted { ceiling: self.ceiling });
            }
            tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    break permit.map_err(|_| CapacityError::Closed)?;
                }
                _ = notified => {}
            }
        };

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve(memory) {
                break;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(CapacityError::Closed);
            }
            notified.await;
        }

        let slot = self.lock_free_slots().pop_first();
        let Some(slot) = slot else {
            // Permits and free slots move together, so this is unreachable
            self.reserved_memory.fetch_sub(memory, Ordering::SeqCst);
            return Err(CapacityError::Closed);
        };

        tracing::debug!(slot, memory, active = self.active(), "admitted");
        Ok(Admission {
            slot,
            box_id: box_id(slot),
            memory,
            permit: Some(permit),
            capacity: Arc::clone(self),
        })
    }

    fn try_reserve(&self, memory: u64) -> bool {
        self.reserved_memory
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current.checked_add(memory)?;
                (next <= self.memory_budget).then_some(next)
            })
            .is_ok()
    }

    fn lock_free_slots(&self) -> std::sync::MutexGuard<'_, BTreeSet<usize>> {
        self.free_slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop admitting. Waiters get `Closed`; existing admissions are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slots.close();
        self.released.notify_waiters();
    }
}

/// One admitted job: a slot (and its box id) plus a memory reservation.
/// Dropping it returns both.
pub struct Admission {
    pub slot: usize,
    pub box_id: String,
    pub memory: u64,
    permit: Option<OwnedSemaphorePermit>,
    capacity: Arc<Capacity>,
}

impl Admission {
    /// The box behind this slot could not be torn down. Keep the slot out of
    /// circulation so its id is never reused, but give the memory back.
    pub fn retire(mut self) -> RetiredSlot {
        if let Some(permit) = self.permit.take() {
            permit.forget();
        }
        self.capacity.retired.fetch_add(1, Ordering::SeqCst);
        self.capacity.reserved_memory.fetch_sub(self.memory, Ordering::SeqCst);
        self.capacity.released.notify_waiters();
        tracing::warn!(slot = self.slot, box_id = %self.box_id, "slot retired after failed cleanup");

        RetiredSlot {
            slot: self.slot,
            box_id: std::mem::take(&mut self.box_id),
            capacity: Arc::clone(&self.capacity),
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("slot", &self.slot)
            .field("box_id", &self.box_id)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        self.capacity.lock_free_slots().insert(self.slot);
        self.capacity.reserved_memory.fetch_sub(self.memory, Ordering::SeqCst);
        drop(permit);
        self.capacity.released.notify_waiters();
    }
}

/// A slot whose box is still waiting to be torn down. Dropping it leaves the
/// slot out of circulation for good.
#[must_use]
pub struct RetiredSlot {
    pub slot: usize,
    pub box_id: String,
    capacity: Arc<Capacity>,
}

impl std::fmt::Debug for RetiredSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetiredSlot")
            .field("slot", &self.slot)
            .field("box_id", &self.box_id)
            .finish_non_exhaustive()
    }
}

impl RetiredSlot {
    /// The box is finally gone: put the slot back in circulation.
    pub fn reinstate(self) {
        self.capacity.lock_free_slots().insert(self.slot);
        self.capacity.retired.fetch_sub(1, Ordering::SeqCst);
        self.capacity.slots.add_permits(1);
        self.capacity.released.notify_waiters();
        tracing::info!(slot = self.slot, box_id = %self.box_id, "retired slot reinstated");
    }

    pub fn is_closed(&self) -> bool {
        self.capacity.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn test_lowest_free_slot_first() {
        let capacity = Capacity::new(3, 1024 * MB);
        let a = capacity.admit(MB).await.unwrap();
        let b = capacity.admit(MB).await.unwrap();
        assert_eq!((a.slot, b.slot), (0, 1));
        assert_eq!(a.box_id, "box-0");

        drop(a);
        let c = capacity.admit(MB).await.unwrap();
        assert_eq!(c.slot, 0);
        assert_eq!(capacity.active(), 2);
        assert_eq!(capacity.reserved_memory(), 2 * MB);
    }

    #[tokio::test]
    async fn test_hard_ceiling_rejected() {
        let capacity = Capacity::new(2, 100 * MB);
        let err = capacity.admit(101 * MB).await.unwrap_err();
        assert_eq!(
            err,
            CapacityError::HardCeiling {
                requested: 101 * MB,
                budget: 100 * MB
            }
        );
    }

    #[tokio::test]
    async fn test_waits_for_memory() {
        let capacity = Capacity::new(4, 100 * MB);
        let big = capacity.admit(80 * MB).await.unwrap();

        let waiter = {
            let capacity = Arc::clone(&capacity);
            tokio::spawn(async move { capacity.admit(40 * MB).await.map(|a| a.slot) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(big);
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        // The freed slot is the lowest one again
        assert_eq!(slot, 0);
    }

    #[tokio::test]
    async fn test_fifo_not_affected_by_request_size() {
        let capacity = Capacity::new(1, 100 * MB);
        let holder = capacity.admit(10 * MB).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for (i, memory) in [(0, 90 * MB), (1, MB), (2, 50 * MB)] {
            let capacity = Arc::clone(&capacity);
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let admission = capacity.admit(memory).await.unwrap();
                tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(admission);
            }));
            // Make arrival order deterministic
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(holder);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_retire_keeps_slot_out() {
        let capacity = Capacity::new(2, 100 * MB);
        let a = capacity.admit(MB).await.unwrap();
        let _retired = a.retire();
        assert_eq!(capacity.reserved_memory(), 0);

        let b = capacity.admit(MB).await.unwrap();
        assert_eq!(b.slot, 1);
        assert_eq!(capacity.active(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), capacity.admit(MB)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_all_slots_retired_fails_fast() {
        let capacity = Capacity::new(1, 100 * MB);
        let retired = capacity.admit(MB).await.unwrap().retire();

        let err = tokio::time::timeout(Duration::from_secs(1), capacity.admit(MB))
            .await
            .expect("admission must not block when no slot can ever free up")
            .unwrap_err();
        assert_eq!(err, CapacityError::Exhausted { ceiling: 1 });
        assert_eq!(retired.slot, 0);
    }

    #[tokio::test]
    async fn test_waiter_fails_when_last_slot_retires() {
        let capacity = Capacity::new(1, 100 * MB);
        let held = capacity.admit(MB).await.unwrap();
        let waiter = {
            let capacity = Arc::clone(&capacity);
            tokio::spawn(async move { capacity.admit(MB).await.err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _retired = held.retire();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(err, Some(CapacityError::Exhausted { ceiling: 1 }));
    }

    #[tokio::test]
    async fn test_reinstated_slot_is_reused() {
        let capacity = Capacity::new(2, 100 * MB);
        let a = capacity.admit(MB).await.unwrap();
        let b = capacity.admit(MB).await.unwrap();
        let retired = a.retire();
        let waiter = {
            let capacity = Arc::clone(&capacity);
            tokio::spawn(async move { capacity.admit(MB).await.map(|a| a.slot) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        retired.reinstate();
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(slot, 0);
        assert_eq!(capacity.active(), 1);
        drop(b);
        assert_eq!(capacity.active(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let capacity = Capacity::new(1, 100 * MB);
        let _held = capacity.admit(MB).await.unwrap();
        let waiter = {
            let capacity = Arc::clone(&capacity);
            tokio::spawn(async move { capacity.admit(MB).await.err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        capacity.close();
        assert_eq!(waiter.await.unwrap(), Some(CapacityError::Closed));
    }

    #[tokio::test]
    async fn test_ceiling_holds_under_load() {
        let capacity = Capacity::new(3, 1024 * MB);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let capacity = Arc::clone(&capacity);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            tasks.push(tokio::spawn(async move {
                let admission = capacity.admit(MB).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(admission);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(capacity.active(), 0);
    }
}
