//! One shared cache per provider type.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use super::{StateCache, StateCacheConfig, StateProvider};

/// Hands out a single [`StateCache`] per provider type.
pub struct StateCacheRegistry {
    config: StateCacheConfig,
    caches: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for StateCacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCacheRegistry")
            .field("config", &self.config)
            .field("caches", &self.len())
            .finish()
    }
}

impl StateCacheRegistry {
    /// Creates an empty registry whose caches use `config`.
    #[must_use]
    pub fn new(config: StateCacheConfig) -> Self {
        Self {
            config,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the process-wide registry, configured from
    /// [`CordonConfig::state_cache`](crate::config::CordonConfig::state_cache).
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<StateCacheRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(crate::config::global().state_cache.clone()))
    }

    /// Returns the cache for `P`, creating it from `P::default()` and
    /// starting its thread if needed.
    pub fn get_or_start<P>(&self) -> StateCache<P>
    where
        P: StateProvider + Default,
    {
        self.get_or_start_with(P::default)
    }

    /// Like [`get_or_start`](Self::get_or_start) with an explicit provider
    /// constructor, called only when no cache exists yet.
    pub fn get_or_start_with<P, F>(&self, make: F) -> StateCache<P>
    where
        P: StateProvider,
        F: FnOnce() -> P,
    {
        let cache = {
            let mut caches = self.caches.lock();
            let existing = caches
                .get(&TypeId::of::<P>())
                .and_then(|c| c.downcast_ref::<StateCache<P>>())
                .cloned();
            existing.unwrap_or_else(|| {
                let cache = StateCache::new(make(), self.config.clone());
                caches.insert(TypeId::of::<P>(), Box::new(cache.clone()));
                cache
            })
        };
        if let Err(err) = cache.start() {
            tracing::warn!(error = %err, "state cache could not start");
        }
        cache
    }

    /// Returns the number of registered caches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    /// Returns true if no cache is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
