//! Storage for cached slots.
//!
//! A loader doesn't care where its slots are memoized as long as the storage implements [`CacheMap`]. The storage is
//! created by a [`CacheFactory`] when the loader is built, so the factory can be picked without spelling out the key
//! and value types:
//!
//! ```ignore
//! let loader = Loader::builder(users)
//!     .cache(BoundedCache::new(10_000))
//!     .build();
//! ```
//!
//! All storage methods are called under the loader's state lock, hence `&mut self` everywhere.

use moka::policy::EvictionPolicy;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;

pub trait CacheMap<K, V>: Send + Sync + 'static {
    fn get(&mut self, key: &K) -> Option<V>;

    /// Put a key-value pair into the cache, replacing any existing value of the key.
    fn insert(&mut self, key: K, value: V);

    fn remove(&mut self, key: &K) -> Option<V>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Produces the storage of a loader.
pub trait CacheFactory<K, V>: Send + Sync + 'static
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage: CacheMap<K, V>;

    /// `name` is the name of the loader the storage is created for.
    fn create(&self, name: &str) -> Self::Storage;
}

/// Unbounded [`HashMap`] storage. This is what loaders use by default: entries are only ever removed explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashMapCache;

impl<K, V> CacheFactory<K, V> for HashMapCache
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage = HashMapStorage<K, V>;

    fn create(&self, _name: &str) -> Self::Storage {
        HashMapStorage(HashMap::new())
    }
}

#[derive(Debug)]
pub struct HashMapStorage<K, V>(HashMap<K, V>);

impl<K, V> CacheMap<K, V> for HashMapStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[inline]
    fn get(&mut self, key: &K) -> Option<V> {
        self.0.get(key).cloned()
    }

    #[inline]
    fn insert(&mut self, key: K, value: V) {
        self.0.insert(key, value);
    }

    #[inline]
    fn remove(&mut self, key: &K) -> Option<V> {
        self.0.remove(key)
    }

    #[inline]
    fn clear(&mut self) {
        self.0.clear();
    }

    #[inline]
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Disables memoization. Repeated loads of a key are not deduplicated either, each gets its own place in a batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl<K, V> CacheFactory<K, V> for NoCache
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage = NoStorage<K, V>;

    fn create(&self, _name: &str) -> Self::Storage {
        NoStorage {
            _mark: PhantomData,
        }
    }
}

#[derive(Debug)]
pub struct NoStorage<K, V> {
    _mark: PhantomData<fn() -> (K, V)>,
}

impl<K, V> CacheMap<K, V> for NoStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[inline]
    fn get(&mut self, _key: &K) -> Option<V> {
        None
    }

    #[inline]
    fn insert(&mut self, _key: K, _value: V) {}

    #[inline]
    fn remove(&mut self, _key: &K) -> Option<V> {
        None
    }

    #[inline]
    fn clear(&mut self) {}

    #[inline]
    fn len(&self) -> usize {
        0
    }
}

/// Capacity-bound storage over a [moka](https://crates.io/crates/moka) cache with TinyLFU eviction.
///
/// Note that an evicted key which is still in flight loses its deduplication: the next load of it goes into a new
/// batch.
#[derive(Debug, Clone, Copy)]
pub struct BoundedCache {
    max_capacity: u64,
}

impl BoundedCache {
    pub fn new(max_capacity: u64) -> Self {
        Self { max_capacity }
    }

    #[inline]
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }
}

impl<K, V> CacheFactory<K, V> for BoundedCache
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage = BoundedStorage<K, V>;

    fn create(&self, name: &str) -> Self::Storage {
        BoundedStorage(
            moka::sync::Cache::builder()
                .max_capacity(self.max_capacity)
                .name(name)
                .eviction_policy(EvictionPolicy::tiny_lfu())
                .build(),
        )
    }
}

pub struct BoundedStorage<K, V>(moka::sync::Cache<K, V>);

impl<K, V> CacheMap<K, V> for BoundedStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[inline]
    fn get(&mut self, key: &K) -> Option<V> {
        self.0.get(key)
    }

    #[inline]
    fn insert(&mut self, key: K, value: V) {
        self.0.insert(key, value);
    }

    #[inline]
    fn remove(&mut self, key: &K) -> Option<V> {
        self.0.remove(key)
    }

    fn clear(&mut self) {
        self.0.invalidate_all();
    }

    fn len(&self) -> usize {
        // moka counts entries lazily.
        self.0.run_pending_tasks();
        self.0.entry_count() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<S: CacheMap<u32, String>>(storage: &mut S) {
        assert!(storage.is_empty());
        storage.insert(1, "one".to_string());
        storage.insert(2, "two".to_string());
        assert_eq!(storage.get(&1).as_deref(), Some("one"));
        storage.insert(1, "uno".to_string());
        assert_eq!(storage.get(&1).as_deref(), Some("uno"));
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.remove(&2).as_deref(), Some("two"));
        assert!(storage.get(&2).is_none());
        storage.clear();
        assert!(storage.get(&1).is_none());
    }

    #[test]
    fn hash_map_storage() {
        let mut storage = CacheFactory::<u32, String>::create(&HashMapCache, "test");
        exercise(&mut storage);
        assert!(storage.is_empty());
    }

    #[test]
    fn bounded_storage() {
        let factory = BoundedCache::new(100);
        assert_eq!(factory.max_capacity(), 100);
        let mut storage = CacheFactory::<u32, String>::create(&factory, "test");
        exercise(&mut storage);
    }

    #[test]
    fn no_storage_keeps_nothing() {
        let mut storage = CacheFactory::<u32, String>::create(&NoCache, "test");
        storage.insert(1, "one".to_string());
        assert!(storage.get(&1).is_none());
        assert!(storage.remove(&1).is_none());
        assert!(storage.is_empty());
    }
}
