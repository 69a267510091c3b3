//! Identifier allocation
//!
//! Lock-free counters issuing strictly increasing ids starting at 1.
//! Users, rooms, messages and sessions each draw from their own counter.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{MessageId, RoomId, SessionToken, UserId};

/// Strictly increasing id source, safe to share between tasks
///
/// Values are never reused. Gaps are allowed (an id taken by an
/// operation that later fails is simply skipped).
#[derive(Debug)]
pub struct IdAllocator<T> {
    next: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: From<u64>> IdAllocator<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            _marker: PhantomData,
        }
    }

    /// Issue the next id
    pub fn next(&self) -> T {
        T::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl<T: From<u64>> Default for IdAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The independent counters used by the registry
#[derive(Debug, Default)]
pub struct Allocators {
    pub users: IdAllocator<UserId>,
    pub rooms: IdAllocator<RoomId>,
    pub messages: IdAllocator<MessageId>,
    pub sessions: IdAllocator<SessionToken>,
}
