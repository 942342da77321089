//! Forwarding-chain storage behind the mergeable collections.
//!
//! Each handle points at a [`Body`]. A body either owns the live storage or
//! has been retired by a merge and forwards to the body that now owns the
//! merged storage. Every operation first resolves the chain to its tail.
//!
//! Merges are serialized by the [`MergeDomain`] lock, so two concurrent
//! merges can never produce two different tails for the same body. Plain
//! operations never take the domain lock; they lock only the tail's storage
//! and retry if a merge retired it in the meantime.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct DomainInner {
    id: u64,
    lock: Mutex<()>,
    merges: AtomicU64,
}

/// Scope within which shared collections may be merged.
///
/// Every merge in a domain runs under the domain's single lock. Collections
/// from different domains cannot be merged. [`MergeDomain::global`] is the
/// default; tests create isolated domains with [`MergeDomain::new`].
#[derive(Clone, Debug)]
pub struct MergeDomain {
    inner: Arc<DomainInner>,
}

impl Default for MergeDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeDomain {
    /// Creates an isolated domain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DomainInner {
                id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
                lock: Mutex::new(()),
                merges: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the process-wide domain.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<MergeDomain> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the domain id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns how many merges have completed in this domain.
    #[must_use]
    pub fn merge_count(&self) -> u64 {
        self.inner.merges.load(Ordering::Relaxed)
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock.lock()
    }
}

/// One link of the forwarding chain.
struct Body<S> {
    /// `None` once retired.
    storage: Mutex<Option<S>>,
    next: Mutex<Option<Arc<Body<S>>>>,
}

impl<S> Body<S> {
    fn new(storage: S) -> Arc<Self> {
        Arc::new(Self {
            storage: Mutex::new(Some(storage)),
            next: Mutex::new(None),
        })
    }
}

/// A handle onto a forwarding chain.
pub(crate) struct Shared<S> {
    domain: MergeDomain,
    /// Last tail this handle resolved; only ever moves forward.
    body: Mutex<Arc<Body<S>>>,
}

impl<S> fmt::Debug for Shared<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("domain", &self.domain.id())
            .finish_non_exhaustive()
    }
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            body: Mutex::new(self.tail()),
        }
    }
}

impl<S> Shared<S> {
    pub(crate) fn new(domain: MergeDomain, storage: S) -> Self {
        Self {
            domain,
            body: Mutex::new(Body::new(storage)),
        }
    }

    pub(crate) fn domain(&self) -> &MergeDomain {
        &self.domain
    }

    /// Resolves the chain to its tail and caches it.
    fn tail(&self) -> Arc<Body<S>> {
        let mut current = self.body.lock().clone();
        loop {
            let next = current.next.lock().clone();
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        *self.body.lock() = Arc::clone(&current);
        current
    }

    /// Runs `f` on the live storage.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        loop {
            let tail = self.tail();
            let mut storage = tail.storage.lock();
            if let Some(storage) = storage.as_mut() {
                return f(storage);
            }
            // Retired between resolve and lock; follow the new link.
        }
    }

    /// Returns true if both handles resolve to the same storage.
    pub(crate) fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tail(), &other.tail())
    }

    /// Unites the storage behind `self` and `other` into one merged body.
    ///
    /// `merge` receives `(ours, theirs)`. Returns `Ok(false)` if the handles
    /// already share storage.
    pub(crate) fn encounter(&self, other: &Self, merge: impl FnOnce(S, S) -> S) -> Result<bool> {
        if !self.domain.same(&other.domain) {
            return Err(Error::misuse(format!(
                "cannot merge across domains {} and {}",
                self.domain.id(),
                other.domain.id()
            )));
        }
        let _merge = self.domain.lock();
        let ours = self.tail();
        let theirs = other.tail();
        if Arc::ptr_eq(&ours, &theirs) {
            return Ok(false);
        }

        let mut our_storage = ours.storage.lock();
        let mut their_storage = theirs.storage.lock();
        // Tails only retire under the domain lock, which we hold.
        let (a, b) = match (our_storage.take(), their_storage.take()) {
            (Some(a), Some(b)) => (a, b),
            (a, b) => {
                *our_storage = a;
                *their_storage = b;
                return Err(Error::internal("merge found a retired tail"));
            }
        };
        let merged = Body::new(merge(a, b));
        *ours.next.lock() = Some(Arc::clone(&merged));
        *theirs.next.lock() = Some(Arc::clone(&merged));
        drop(their_storage);
        drop(our_storage);

        *self.body.lock() = Arc::clone(&merged);
        *other.body.lock() = merged;
        self.domain.inner.merges.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(domain = self.domain.id(), "shared storage merged");
        Ok(true)
    }
}
