use boxoffice_core::error::{StoreError, UniqueConstraint};
use boxoffice_core::store::{CasOutcome, InventoryStore, StoreFuture};
use boxoffice_core::types::{EventId, EventInventory};
use std::collections::HashMap;
use std::future::ready;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// In-memory seat counters with compare-and-set.
///
/// # Example
///
/// ```
/// use boxoffice::memory::InMemoryInventoryStore;
/// use boxoffice_core::store::{CasOutcome, InventoryStore};
/// use boxoffice_core::types::{EventId, EventInventory};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryInventoryStore::new();
/// let event_id = EventId::new();
/// store.insert(EventInventory::new(event_id, 10, Utc::now())).await?;
///
/// let applied = store.compare_and_set(event_id, 0, 9).await?;
/// assert!(matches!(applied, CasOutcome::Applied(ref inv) if inv.version == 1));
///
/// // Version 0 is now stale.
/// let stale = store.compare_and_set(event_id, 0, 8).await?;
/// assert!(matches!(stale, CasOutcome::Stale(_)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    events: RwLock<HashMap<EventId, Arc<Mutex<EventInventory>>>>,
}

impl InMemoryInventoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event_id: EventId) -> Option<Arc<Mutex<EventInventory>>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .cloned()
    }

    fn insert_now(&self, inventory: EventInventory) -> Result<(), StoreError> {
        if inventory.available > inventory.capacity {
            return Err(StoreError::Invariant(format!(
                "inventory for event {} has available {} above capacity {}",
                inventory.event_id, inventory.available, inventory.capacity
            )));
        }

        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.contains_key(&inventory.event_id) {
            return Err(StoreError::Duplicate(UniqueConstraint::EventInventory));
        }
        events.insert(inventory.event_id, Arc::new(Mutex::new(inventory)));
        Ok(())
    }

    fn load_now(&self, event_id: EventId) -> Option<EventInventory> {
        self.record(event_id)
            .map(|record| record.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn compare_and_set_now(
        &self,
        event_id: EventId,
        expected_version: u64,
        available: u32,
    ) -> Result<CasOutcome, StoreError> {
        let record = self
            .record(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("inventory for event {event_id}")))?;
        let mut current = record.lock().unwrap_or_else(PoisonError::into_inner);

        if current.version != expected_version {
            return Ok(CasOutcome::Stale(current.clone()));
        }
        if available > current.capacity {
            return Err(StoreError::Invariant(format!(
                "available {available} above capacity {} for event {event_id}",
                current.capacity
            )));
        }

        current.available = available;
        current.version += 1;
        Ok(CasOutcome::Applied(current.clone()))
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn insert(&self, inventory: EventInventory) -> StoreFuture<'_, ()> {
        Box::pin(ready(self.insert_now(inventory)))
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, Option<EventInventory>> {
        Box::pin(ready(Ok(self.load_now(event_id))))
    }

    fn compare_and_set(
        &self,
        event_id: EventId,
        expected_version: u64,
        available: u32,
    ) -> StoreFuture<'_, CasOutcome> {
        Box::pin(ready(self.compare_and_set_now(
            event_id,
            expected_version,
            available,
        )))
    }
}
