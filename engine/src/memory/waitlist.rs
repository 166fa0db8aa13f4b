use boxoffice_core::error::StoreError;
use boxoffice_core::store::{Enqueued, StoreFuture, WaitlistStore, check_transition};
use boxoffice_core::types::{EventId, UserId, WaitlistEntry, WaitlistId, WaitlistStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::ready;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// One event's queue.
///
/// `waiting[i]` holds position `i + 1`, so positions are dense by
/// construction; each entry's `position` field is kept equal to it.
#[derive(Debug, Default)]
struct EventQueue {
    entries: HashMap<WaitlistId, (u64, WaitlistEntry)>,
    waiting: Vec<WaitlistId>,
}

impl EventQueue {
    fn entry(&self, id: WaitlistId) -> Result<&WaitlistEntry, StoreError> {
        self.entries
            .get(&id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| not_found(id))
    }

    fn waiting_index(&self, id: WaitlistId) -> Option<usize> {
        self.waiting.iter().position(|w| *w == id)
    }

    /// Take the entry at `index` out of the waiting order and renumber the tail.
    fn unlink(&mut self, index: usize) -> WaitlistId {
        let id = self.waiting.remove(index);
        for later in &self.waiting[index..] {
            if let Some((_, entry)) = self.entries.get_mut(later) {
                entry.position -= 1;
            }
        }
        id
    }

    fn check_dense(&self) -> Result<(), StoreError> {
        for (index, id) in self.waiting.iter().enumerate() {
            let entry = self.entry(*id)?;
            let expected = u32::try_from(index + 1).unwrap_or(u32::MAX);
            if entry.status != WaitlistStatus::Waiting || entry.position != expected {
                return Err(StoreError::Invariant(format!(
                    "waitlist entry {id} at rank {expected} has position {} and status {}",
                    entry.position, entry.status
                )));
            }
        }
        Ok(())
    }
}

/// In-memory waitlist with one lock per event.
///
/// Joins, leaves and head promotion for the same event are serialised by that
/// event's lock, so two users can never be handed the same position.
#[derive(Debug, Default)]
pub struct InMemoryWaitlistStore {
    queues: RwLock<HashMap<EventId, Arc<Mutex<EventQueue>>>>,
    index: RwLock<HashMap<WaitlistId, EventId>>,
    sequence: AtomicU64,
}

impl InMemoryWaitlistStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, event_id: EventId) -> Option<Arc<Mutex<EventQueue>>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .cloned()
    }

    fn queue_or_create(&self, event_id: EventId) -> Arc<Mutex<EventQueue>> {
        if let Some(queue) = self.queue(event_id) {
            return queue;
        }
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_id)
            .or_default()
            .clone()
    }

    fn queue_of(&self, waitlist_id: WaitlistId) -> Result<Arc<Mutex<EventQueue>>, StoreError> {
        let event_id = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&waitlist_id)
            .copied()
            .ok_or_else(|| not_found(waitlist_id))?;
        self.queue(event_id).ok_or_else(|| not_found(waitlist_id))
    }

    fn all_queues(&self) -> Vec<Arc<Mutex<EventQueue>>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn enqueue_now(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> Result<Enqueued, StoreError> {
        let queue = self.queue_or_create(event_id);
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((_, existing)) = queue
            .entries
            .values()
            .find(|(_, e)| e.user_id == user_id && e.status.is_active())
        {
            let mut existing = existing.clone();
            if let Some(index) = queue.waiting_index(existing.waitlist_id) {
                existing.position = u32::try_from(index + 1).unwrap_or(u32::MAX);
            }
            return Ok(Enqueued::Existing(existing));
        }

        let waiting = u32::try_from(queue.waiting.len()).unwrap_or(u32::MAX);
        if waiting >= max_waiting {
            return Ok(Enqueued::Full);
        }

        let entry = WaitlistEntry::waiting(user_id, event_id, waiting + 1, now);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        queue.waiting.push(entry.waitlist_id);
        queue.entries.insert(entry.waitlist_id, (seq, entry.clone()));
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.waitlist_id, event_id);

        queue.check_dense()?;
        Ok(Enqueued::Created(entry))
    }

    fn get_now(&self, waitlist_id: WaitlistId) -> Option<WaitlistEntry> {
        let queue = self.queue_of(waitlist_id).ok()?;
        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.entry(waitlist_id).ok().cloned()
    }

    fn find_active_now(&self, user_id: UserId, event_id: EventId) -> Option<WaitlistEntry> {
        let queue = self.queue(event_id)?;
        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue
            .entries
            .values()
            .map(|(_, e)| e)
            .find(|e| e.user_id == user_id && e.status.is_active())
            .cloned()
    }

    fn live_position_now(&self, waitlist_id: WaitlistId) -> Result<Option<u32>, StoreError> {
        let queue = self.queue_of(waitlist_id)?;
        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.entry(waitlist_id)?;
        Ok(queue
            .waiting_index(waitlist_id)
            .map(|index| u32::try_from(index + 1).unwrap_or(u32::MAX)))
    }

    fn remove_waiting_now(&self, waitlist_id: WaitlistId) -> Result<WaitlistEntry, StoreError> {
        let queue = self.queue_of(waitlist_id)?;
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);

        let status = queue.entry(waitlist_id)?.status;
        let index = queue
            .waiting_index(waitlist_id)
            .filter(|_| status == WaitlistStatus::Waiting)
            .ok_or_else(|| StoreError::StatusMismatch {
                id: waitlist_id.to_string(),
                expected: WaitlistStatus::Waiting.as_str(),
                actual: status.as_str(),
            })?;

        queue.unlink(index);
        let (_, removed) = queue
            .entries
            .remove(&waitlist_id)
            .ok_or_else(|| not_found(waitlist_id))?;
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&waitlist_id);

        queue.check_dense()?;
        Ok(removed)
    }

    fn waiting_now(&self, event_id: EventId) -> Vec<WaitlistEntry> {
        let Some(queue) = self.queue(event_id) else {
            return Vec::new();
        };
        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue
            .waiting
            .iter()
            .filter_map(|id| queue.entry(*id).ok().cloned())
            .collect()
    }

    fn for_user_now(&self, user_id: UserId) -> Vec<WaitlistEntry> {
        let mut found: Vec<(u64, WaitlistEntry)> = Vec::new();
        for queue in self.all_queues() {
            let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            found.extend(
                queue
                    .entries
                    .values()
                    .filter(|(_, e)| e.user_id == user_id)
                    .cloned(),
            );
        }
        found.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        found.into_iter().map(|(_, e)| e).collect()
    }

    fn head_now(&self, event_id: EventId) -> Option<WaitlistEntry> {
        let queue = self.queue(event_id)?;
        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue
            .waiting
            .first()
            .and_then(|id| queue.entry(*id).ok().cloned())
    }

    fn promote_head_now(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        let Some(queue) = self.queue(event_id) else {
            return Ok(None);
        };
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.waiting.is_empty() {
            return Ok(None);
        }

        let id = queue.unlink(0);
        let (_, entry) = queue.entries.get_mut(&id).ok_or_else(|| not_found(id))?;
        entry.status = WaitlistStatus::Notified;
        entry.notified_at = Some(notified_at);
        entry.expires_at = Some(expires_at);
        let promoted = entry.clone();

        queue.check_dense()?;
        Ok(Some(promoted))
    }

    fn transition_now(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> Result<WaitlistEntry, StoreError> {
        check_transition(from, to)?;

        let queue = self.queue_of(waitlist_id)?;
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, entry) = queue
            .entries
            .get_mut(&waitlist_id)
            .ok_or_else(|| not_found(waitlist_id))?;

        if entry.status != from {
            return Err(StoreError::StatusMismatch {
                id: waitlist_id.to_string(),
                expected: from.as_str(),
                actual: entry.status.as_str(),
            });
        }
        entry.status = to;
        Ok(entry.clone())
    }

    fn overdue_now(&self, now: DateTime<Utc>) -> Vec<WaitlistEntry> {
        let mut overdue: Vec<WaitlistEntry> = Vec::new();
        for queue in self.all_queues() {
            let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            overdue.extend(
                queue
                    .entries
                    .values()
                    .map(|(_, e)| e)
                    .filter(|e| e.is_overdue(now))
                    .cloned(),
            );
        }
        overdue.sort_by_key(|e| e.expires_at);
        overdue
    }
}

fn not_found(id: WaitlistId) -> StoreError {
    StoreError::NotFound(format!("waitlist entry {id}"))
}

impl WaitlistStore for InMemoryWaitlistStore {
    fn enqueue(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> StoreFuture<'_, Enqueued> {
        Box::pin(ready(self.enqueue_now(user_id, event_id, now, max_waiting)))
    }

    fn get(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(ready(Ok(self.get_now(waitlist_id))))
    }

    fn find_active(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(ready(Ok(self.find_active_now(user_id, event_id))))
    }

    fn live_position(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(ready(self.live_position_now(waitlist_id)))
    }

    fn remove_waiting(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, WaitlistEntry> {
        Box::pin(ready(self.remove_waiting_now(waitlist_id)))
    }

    fn waiting(&self, event_id: EventId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(ready(Ok(self.waiting_now(event_id))))
    }

    fn for_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(ready(Ok(self.for_user_now(user_id))))
    }

    fn head(&self, event_id: EventId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(ready(Ok(self.head_now(event_id))))
    }

    fn promote_head(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(ready(self.promote_head_now(
            event_id,
            notified_at,
            expires_at,
        )))
    }

    fn transition(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> StoreFuture<'_, WaitlistEntry> {
        Box::pin(ready(self.transition_now(waitlist_id, from, to)))
    }

    fn overdue(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(ready(Ok(self.overdue_now(now))))
    }
}
