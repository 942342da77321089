//! Mergeable ranked membership.
//!
//! Members occupy contiguous ranks `1..=len`, rank 1 being the top. Joining
//! relative to another member shifts everything at or below the insertion
//! point down by one; resigning closes the gap.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::body::{MergeDomain, Shared};
use crate::error::{Error, Result};

static NEXT_MEMBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a hierarchy member, unique for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    fn next() -> Self {
        Self(NEXT_MEMBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member#{}", self.0)
    }
}

/// Where a join lands relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Directly below the target; with no target, at the bottom.
    Subordinate,
    /// Directly above the target; with no target, at the top.
    Superior,
}

struct Ranks<T> {
    /// Index `i` holds rank `i + 1`.
    members: Vec<(MemberId, T)>,
}

impl<T> Ranks<T> {
    fn index_of(&self, id: MemberId) -> Option<usize> {
        self.members.iter().position(|(m, _)| *m == id)
    }

    fn insertion_index(&self, target: Option<MemberId>, placement: Placement) -> Option<usize> {
        match (target, placement) {
            (None, Placement::Subordinate) => Some(self.members.len()),
            (None, Placement::Superior) => Some(0),
            (Some(id), Placement::Subordinate) => self.index_of(id).map(|i| i + 1),
            (Some(id), Placement::Superior) => self.index_of(id),
        }
    }

    /// Splices `other` in as a block; an unknown target puts it at the
    /// bottom.
    fn splice(mut self, other: Self, target: Option<MemberId>, placement: Placement) -> Self {
        let at = self
            .insertion_index(target, placement)
            .unwrap_or(self.members.len());
        let tail = self.members.split_off(at);
        self.members.extend(other.members);
        self.members.extend(tail);
        self
    }
}

/// A ranked collection that can be merged with another hierarchy.
///
/// ```
/// use cordon::{Placement, SharedHierarchy};
///
/// let h = SharedHierarchy::new();
/// let boss = h.join("boss", None, Placement::Subordinate).unwrap();
/// let deputy = h.join("deputy", Some(boss), Placement::Subordinate).unwrap();
/// assert_eq!(h.position(boss), Some(1));
/// assert_eq!(h.position(deputy), Some(2));
/// ```
pub struct SharedHierarchy<T> {
    shared: Shared<Ranks<T>>,
}

impl<T> Clone for SharedHierarchy<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedHierarchy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHierarchy")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for SharedHierarchy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedHierarchy<T> {
    /// Creates an empty hierarchy in the global merge domain.
    #[must_use]
    pub fn new() -> Self {
        Self::in_domain(MergeDomain::global())
    }

    /// Creates an empty hierarchy in `domain`.
    #[must_use]
    pub fn in_domain(domain: &MergeDomain) -> Self {
        Self {
            shared: Shared::new(
                domain.clone(),
                Ranks {
                    members: Vec::new(),
                },
            ),
        }
    }

    /// Inserts `item` next to `target` and returns its new id.
    ///
    /// Returns `Misuse` if `target` is not a member.
    pub fn join(&self, item: T, target: Option<MemberId>, placement: Placement) -> Result<MemberId> {
        self.shared.with(|ranks| {
            let at = ranks
                .insertion_index(target, placement)
                .ok_or_else(|| unknown(target))?;
            let id = MemberId::next();
            ranks.members.insert(at, (id, item));
            tracing::trace!(%id, rank = at + 1, "member joined");
            Ok(id)
        })
    }

    /// Removes a member and returns its item. Lower ranks move up.
    pub fn resign(&self, id: MemberId) -> Result<T> {
        self.shared.with(|ranks| {
            let index = ranks.index_of(id).ok_or_else(|| unknown(Some(id)))?;
            Ok(ranks.members.remove(index).1)
        })
    }

    /// Returns the 1-based rank of `id`, or `None` if it has not joined.
    #[must_use]
    pub fn position(&self, id: MemberId) -> Option<usize> {
        self.shared.with(|ranks| ranks.index_of(id).map(|i| i + 1))
    }

    /// Returns true if `id` is a member.
    #[must_use]
    pub fn contains(&self, id: MemberId) -> bool {
        self.position(id).is_some()
    }

    /// Returns the member ids, top rank first.
    #[must_use]
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.shared
            .with(|ranks| ranks.members.iter().map(|(id, _)| *id).collect())
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.with(|ranks| ranks.members.len())
    }

    /// Returns true if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if both handles operate on the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.shared.shares_storage_with(&other.shared)
    }

    /// Merges `other` in below every current member.
    pub fn encounter(&self, other: &Self) -> Result<bool> {
        self.encounter_at(other, None, Placement::Subordinate)
    }

    /// Merges `other`'s members in as a block next to `target`.
    ///
    /// Ranks are renumbered into one contiguous space. Returns `Misuse` if
    /// `target` is not a member of this hierarchy; if it resigns while the
    /// merge is pending the block goes to the bottom.
    pub fn encounter_at(
        &self,
        other: &Self,
        target: Option<MemberId>,
        placement: Placement,
    ) -> Result<bool> {
        if let Some(id) = target {
            if !self.contains(id) {
                return Err(unknown(target));
            }
        }
        self.shared
            .encounter(&other.shared, |ours, theirs| ours.splice(theirs, target, placement))
    }
}

impl<T: Clone> SharedHierarchy<T> {
    /// Returns the item held by `id`.
    #[must_use]
    pub fn get(&self, id: MemberId) -> Option<T> {
        self.shared.with(|ranks| {
            ranks
                .index_of(id)
                .map(|index| ranks.members[index].1.clone())
        })
    }

    /// Returns `(id, item)` pairs, top rank first.
    #[must_use]
    pub fn members(&self) -> Vec<(MemberId, T)> {
        self.shared.with(|ranks| ranks.members.clone())
    }
}

fn unknown(target: Option<MemberId>) -> Error {
    match target {
        Some(id) => Error::misuse(format!("{id} is not a member of this hierarchy")),
        None => Error::misuse("unknown hierarchy member"),
    }
}
