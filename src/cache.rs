//! Keyed single-flight caches.
//!
//! [`SingleFlightCache`] memoizes the result of a fallible load per key. The
//! first caller for a key runs the loader while later callers for the same key
//! block on that slot; callers for other keys proceed independently. Failed
//! loads leave the slot empty so the next caller retries.
//!
//! [`IndexCache`] specializes it for memory-mapped indices keyed by corpus name.

use std::borrow::Borrow;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::IndexLoadError;
use crate::vector::{AnnIndex, Metric, VectorDimension, VectorError};

type Slot<V> = Arc<RwLock<Option<V>>>;

/// A lazily populated map where each value is loaded at most once.
pub struct SingleFlightCache<K, V> {
    slots: DashMap<K, Slot<V>>,
}

impl<K, V> std::fmt::Debug for SingleFlightCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key`, running `load` if there is none.
    ///
    /// At most one `load` runs per key at a time. Callers that arrive while a
    /// load is in flight wait for it and then reuse its value; if it failed
    /// they see an empty slot and try again themselves.
    pub fn get_or_try_load<E, F>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot(key);

        // Fast path: already loaded
        if let Some(value) = slot.read().as_ref() {
            return Ok(value.clone());
        }

        // Upgradable reads are exclusive with each other, so only one caller
        // per key gets past this point at a time
        let guard = slot.upgradable_read();
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }

        let value = load()?;
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Returns the cached value without loading.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let slot = self.slots.get(key)?.value().clone();
        let value = slot.read().clone();
        value
    }

    /// Drops the entry for `key`; the next lookup loads again.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.slots.remove(key).is_some()
    }

    /// Drops every entry whose key matches `predicate`.
    pub fn invalidate_where(&self, mut predicate: impl FnMut(&K) -> bool) {
        self.slots.retain(|key, _| !predicate(key));
    }

    /// Number of keys with a loaded value.
    pub fn loaded_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().read().is_some())
            .count()
    }

    fn slot(&self, key: &K) -> Slot<V> {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }
        self.slots.entry(key.clone()).or_default().value().clone()
    }
}

/// Shared handle to an opened index.
pub type IndexHandle = Arc<AnnIndex>;

/// Resolves a corpus name to an opened index.
///
/// The production implementation reads paths from configuration; tests plug
/// in their own to count or fail opens.
pub trait IndexSource: Send + Sync {
    fn open(&self, corpus: &str) -> Result<AnnIndex, IndexLoadError>;
}

/// Opens indices at the paths configured under `[corpora]`.
#[derive(Debug, Clone)]
pub struct CorpusIndexSource {
    paths: Vec<(String, PathBuf)>,
    dimension: VectorDimension,
    metric: Metric,
}

impl CorpusIndexSource {
    pub fn new(
        paths: impl IntoIterator<Item = (String, PathBuf)>,
        dimension: VectorDimension,
    ) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            dimension,
            metric: Metric::Angular,
        }
    }

    /// Builds a source from settings, resolving relative paths against the
    /// workspace root.
    pub fn from_settings(settings: &Settings) -> Result<Self, VectorError> {
        let dimension = settings.embedding.vector_dimension()?;
        let paths = settings
            .corpora
            .iter()
            .map(|(name, corpus)| (name.clone(), settings.resolve_path(&corpus.index_path)));
        Ok(Self::new(paths, dimension))
    }
}

impl IndexSource for CorpusIndexSource {
    fn open(&self, corpus: &str) -> Result<AnnIndex, IndexLoadError> {
        let path = self
            .paths
            .iter()
            .find(|(name, _)| name == corpus)
            .map(|(_, path)| path)
            .ok_or_else(|| IndexLoadError::UnknownCorpus {
                corpus: corpus.to_string(),
            })?;
        AnnIndex::open(path, self.dimension, self.metric)
    }
}

/// Process-wide cache of opened indices keyed by corpus name.
pub struct IndexCache {
    source: Box<dyn IndexSource>,
    handles: SingleFlightCache<String, IndexHandle>,
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("loaded", &self.handles.loaded_len())
            .finish_non_exhaustive()
    }
}

impl IndexCache {
    pub fn new(source: impl IndexSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            handles: SingleFlightCache::new(),
        }
    }

    /// Returns the handle for `corpus`, opening the index on first use.
    pub fn get_or_load(&self, corpus: &str) -> Result<IndexHandle, IndexLoadError> {
        self.handles.get_or_try_load(&corpus.to_string(), || {
            debug!("Loading index for corpus '{corpus}'");
            let index = self.source.open(corpus)?;
            info!(
                "Loaded index for corpus '{corpus}' ({} items)",
                index.len()
            );
            Ok(Arc::new(index))
        })
    }

    /// Drops the cached handle; outstanding handles stay valid.
    pub fn invalidate(&self, corpus: &str) -> bool {
        let dropped = self.handles.invalidate(corpus);
        if dropped {
            debug!("Invalidated index for corpus '{corpus}'");
        }
        dropped
    }

    pub fn is_loaded(&self, corpus: &str) -> bool {
        self.handles.get(corpus).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_loads_once_per_key() {
        let cache: SingleFlightCache<String, usize> = SingleFlightCache::new();
        let loads = AtomicUsize::new(0);
        let key = "a".to_string();

        for _ in 0..3 {
            let value: Result<usize, ()> = cache.get_or_try_load(&key, || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            });
            assert_eq!(value, Ok(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_does_not_need_debug_values() {
        struct Opaque;

        let cache: SingleFlightCache<String, Arc<Opaque>> = SingleFlightCache::new();
        let _: Result<_, ()> = cache.get_or_try_load(&"a".to_string(), || Ok(Arc::new(Opaque)));
        assert_eq!(format!("{cache:?}"), "SingleFlightCache { slots: 1 }");
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache: SingleFlightCache<String, usize> = SingleFlightCache::new();
        let key = "a".to_string();

        let first: Result<usize, &str> = cache.get_or_try_load(&key, || Err("boom"));
        assert_eq!(first, Err("boom"));
        assert!(cache.get("a").is_none());

        let second: Result<usize, &str> = cache.get_or_try_load(&key, || Ok(1));
        assert_eq!(second, Ok(1));
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let cache: SingleFlightCache<String, usize> = SingleFlightCache::new();
        let key = "a".to_string();
        let _ = cache.get_or_try_load(&key, || Ok::<_, ()>(1));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        let value = cache.get_or_try_load(&key, || Ok::<_, ()>(2));
        assert_eq!(value, Ok(2));
    }

    #[test]
    fn test_invalidate_where() {
        let cache: SingleFlightCache<(String, usize), usize> = SingleFlightCache::new();
        for (corpus, k) in [("a", 1), ("a", 2), ("b", 1)] {
            let _ = cache.get_or_try_load(&(corpus.to_string(), k), || Ok::<_, ()>(k));
        }

        cache.invalidate_where(|(corpus, _)| corpus == "a");
        assert_eq!(cache.loaded_len(), 1);
        assert_eq!(cache.get(&("b".to_string(), 1)), Some(1));
    }

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let cache: Arc<SingleFlightCache<String, usize>> = Arc::new(SingleFlightCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_try_load(&"a".to_string(), || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok::<_, ()>(42)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(42));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_load_independently() {
        let cache: Arc<SingleFlightCache<String, usize>> = Arc::new(SingleFlightCache::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // A slow load for "slow" must not block "fast"
        let slow = {
            let cache = Arc::clone(&cache);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                cache.get_or_try_load(&"slow".to_string(), || {
                    thread::sleep(Duration::from_millis(200));
                    order.lock().unwrap().push("slow");
                    Ok::<_, ()>(1)
                })
            })
        };
        thread::sleep(Duration::from_millis(20));
        let fast = cache.get_or_try_load(&"fast".to_string(), || {
            order.lock().unwrap().push("fast");
            Ok::<_, ()>(2)
        });

        assert_eq!(fast, Ok(2));
        assert_eq!(slow.join().unwrap(), Ok(1));
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[test]
    fn test_unknown_corpus() {
        let source = CorpusIndexSource::new(Vec::new(), VectorDimension::new(4).unwrap());
        let cache = IndexCache::new(source);

        assert!(matches!(
            cache.get_or_load("missing"),
            Err(IndexLoadError::UnknownCorpus { .. })
        ));
        assert!(!cache.is_loaded("missing"));
    }
}
