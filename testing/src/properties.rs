//! proptest strategies for waitlist operation sequences.
//!
//! A sequence is a list of [`WaitlistOp`]s over a small pool of users. Users
//! are referred to by index so shrinking produces readable failures.

use proptest::prelude::*;

/// One operation applied to a single event's waitlist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitlistOp {
    /// User `n` joins
    Join(usize),
    /// User `n` leaves
    Leave(usize),
    /// `n` seats are freed and the head is notified
    Free(u32),
    /// The user holding a notification books
    Convert(usize),
    /// Every open booking window lapses and is swept
    ExpireAll,
}

/// Strategy producing a single operation over `users` users.
pub fn waitlist_op(users: usize) -> impl Strategy<Value = WaitlistOp> {
    let users = users.max(1);
    prop_oneof![
        4 => (0..users).prop_map(WaitlistOp::Join),
        2 => (0..users).prop_map(WaitlistOp::Leave),
        2 => (1u32..=3).prop_map(WaitlistOp::Free),
        1 => (0..users).prop_map(WaitlistOp::Convert),
        1 => Just(WaitlistOp::ExpireAll),
    ]
}

/// Strategy producing up to `max_len` operations over `users` users.
pub fn waitlist_ops(users: usize, max_len: usize) -> impl Strategy<Value = Vec<WaitlistOp>> {
    prop::collection::vec(waitlist_op(users), 0..=max_len)
}
