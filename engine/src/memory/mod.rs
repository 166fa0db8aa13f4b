//! Process-local storage backend.
//!
//! Every store keeps one lock per event, so work on different events never
//! contends while all mutations within one event are linearizable. Locks are
//! plain `std::sync` locks held only for the duration of a synchronous
//! critical section, never across an `.await`.

mod bookings;
mod inventory;
mod waitlist;

pub use bookings::InMemoryBookingStore;
pub use inventory::InMemoryInventoryStore;
pub use waitlist::InMemoryWaitlistStore;
