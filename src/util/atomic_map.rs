use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map: readers take an `Arc` snapshot and iterate it without holding any lock,
///  writers modify a private copy and swap it in. A snapshot never changes after it was taken.
///
/// The lock is only held for the duration of the pointer swap / `Arc` clone, never while
///  callers work with the map's values.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone, V: Clone> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone, V: Clone> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut lock = self.map.write()
            .unwrap_or_else(|e| e.into_inner());
        // clones the map only if there are outstanding snapshots
        f(Arc::make_mut(&mut lock))
    }
}
