//! Mergeable bounded FIFO.

use std::collections::VecDeque;
use std::fmt;

use super::body::{MergeDomain, Shared};
use crate::error::{Error, ErrorKind, Result};

/// What a full queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Evict the oldest item to make room.
    #[default]
    DropOldest,
    /// Refuse the new item with `CapacityExceeded`.
    Reject,
}

struct QueueStore<T> {
    items: VecDeque<T>,
    capacity: usize,
    policy: QueuePolicy,
}

impl<T> QueueStore<T> {
    fn push(&mut self, item: T) -> Result<Option<T>> {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return Ok(None);
        }
        match self.policy {
            QueuePolicy::DropOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(item);
                Ok(evicted)
            }
            QueuePolicy::Reject => Err(Error::new(ErrorKind::CapacityExceeded)
                .with_message(format!("queue is full ({} items)", self.capacity))),
        }
    }

    /// Union: our items first, then theirs, under the larger bound's policy.
    fn union(mut self, other: Self) -> Self {
        let (capacity, policy) = if other.capacity > self.capacity {
            (other.capacity, other.policy)
        } else {
            (self.capacity, self.policy)
        };
        self.items.extend(other.items);
        let excess = self.items.len().saturating_sub(capacity);
        if excess > 0 {
            match policy {
                QueuePolicy::DropOldest => {
                    self.items.drain(..excess);
                }
                QueuePolicy::Reject => self.items.truncate(capacity),
            }
            tracing::debug!(excess, capacity, "merged queue trimmed to capacity");
        }
        Self {
            items: self.items,
            capacity,
            policy,
        }
    }
}

/// A bounded FIFO that can be merged with another queue.
///
/// After [`encounter`](Self::encounter) both handles (and every clone of
/// either) operate on one queue holding the first queue's items followed
/// by the second's.
///
/// ```
/// use cordon::{QueuePolicy, SharedQueue};
///
/// let a = SharedQueue::new(4, QueuePolicy::DropOldest);
/// let b = SharedQueue::new(4, QueuePolicy::DropOldest);
/// a.enqueue(1).unwrap();
/// b.enqueue(2).unwrap();
/// a.encounter(&b).unwrap();
/// assert_eq!(b.to_vec(), vec![1, 2]);
/// ```
pub struct SharedQueue<T> {
    shared: Shared<QueueStore<T>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, capacity) = self.shared.with(|s| (s.items.len(), s.capacity));
        f.debug_struct("SharedQueue")
            .field("len", &len)
            .field("capacity", &capacity)
            .finish()
    }
}

impl<T> SharedQueue<T> {
    /// Creates a queue in the global merge domain. A zero capacity is
    /// raised to one.
    #[must_use]
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self::in_domain(MergeDomain::global(), capacity, policy)
    }

    /// Creates an unbounded queue in the global merge domain.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, QueuePolicy::DropOldest)
    }

    /// Creates a queue in `domain`.
    #[must_use]
    pub fn in_domain(domain: &MergeDomain, capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            shared: Shared::new(
                domain.clone(),
                QueueStore {
                    items: VecDeque::new(),
                    capacity: capacity.max(1),
                    policy,
                },
            ),
        }
    }

    /// Appends an item, returning the evicted oldest item when full under
    /// [`QueuePolicy::DropOldest`].
    pub fn enqueue(&self, item: T) -> Result<Option<T>> {
        self.shared.with(|s| s.push(item))
    }

    /// Appends `item` unless an existing item matches `is_dup`.
    ///
    /// Returns `Ok(false)` when a duplicate was found.
    pub fn enqueue_unless(&self, item: T, is_dup: impl Fn(&T, &T) -> bool) -> Result<bool> {
        self.shared.with(|s| {
            if s.items.iter().any(|existing| is_dup(existing, &item)) {
                return Ok(false);
            }
            s.push(item).map(|_| true)
        })
    }

    /// Removes and returns the oldest item.
    pub fn dequeue(&self) -> Option<T> {
        self.shared.with(|s| s.items.pop_front())
    }

    /// Returns the current number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.with(|s| s.items.len())
    }

    /// Returns true if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity of the current storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.with(|s| s.capacity)
    }

    /// Returns the eviction policy of the current storage.
    #[must_use]
    pub fn policy(&self) -> QueuePolicy {
        self.shared.with(|s| s.policy)
    }

    /// Removes every item.
    pub fn clear(&self) {
        self.shared.with(|s| s.items.clear());
    }

    /// Returns true if both handles operate on the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.shared.shares_storage_with(&other.shared)
    }

    /// Returns the merge domain of this queue.
    #[must_use]
    pub fn domain(&self) -> &MergeDomain {
        self.shared.domain()
    }

    /// Merges `other` into this queue.
    ///
    /// The merged storage holds this queue's items then `other`'s, bounded
    /// by the larger of the two capacities with that queue's policy. If the
    /// union overflows, [`QueuePolicy::DropOldest`] discards from the front
    /// and [`QueuePolicy::Reject`] discards the newest. Returns `Ok(false)`
    /// if the two were already merged.
    pub fn encounter(&self, other: &Self) -> Result<bool> {
        self.shared.encounter(&other.shared, QueueStore::union)
    }
}

impl<T: Clone> SharedQueue<T> {
    /// Returns the oldest item without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.shared.with(|s| s.items.front().cloned())
    }

    /// Returns a copy of the items, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.shared.with(|s| s.items.iter().cloned().collect())
    }
}
