use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tracing::trace;

/// Storage behind an [`ItemCache`].
pub trait Cache<K, V> {
    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }
    fn get(&self, key: &K) -> Option<V>;
    fn insert(&mut self, key: K, value: V);
    fn remove(&mut self, key: &K) -> Option<V>;
    fn clear(&mut self);
    fn len(&self) -> usize;
}

impl<K, V> Cache<K, V> for HashMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn contains_key(&self, key: &K) -> bool {
        HashMap::contains_key(self, key)
    }

    fn get(&self, key: &K) -> Option<V> {
        HashMap::get(self, key).cloned()
    }

    fn insert(&mut self, key: K, value: V) {
        HashMap::insert(self, key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        HashMap::remove(self, key)
    }

    fn clear(&mut self) {
        HashMap::clear(self);
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}

impl<K, V> Cache<K, V> for BTreeMap<K, V>
where
    K: Ord,
    V: Clone,
{
    fn contains_key(&self, key: &K) -> bool {
        BTreeMap::contains_key(self, key)
    }

    fn get(&self, key: &K) -> Option<V> {
        BTreeMap::get(self, key).cloned()
    }

    fn insert(&mut self, key: K, value: V) {
        BTreeMap::insert(self, key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        BTreeMap::remove(self, key)
    }

    fn clear(&mut self) {
        BTreeMap::clear(self);
    }

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
}

/// A value that knows the point-lookup key it is cached under.
pub trait Keyed<K> {
    fn key(&self) -> K;
}

/// Point-lookup table of successfully resolved values.
///
/// Clones share the same table, which is how a [`Loader`](crate::Loader)
/// and a [`RequestCache`] see each other's entries.
pub struct ItemCache<K, V, C = HashMap<K, V>> {
    inner: Arc<Mutex<C>>,
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

// Manual implementation is used to omit applying unnecessary Clone bounds.
impl<K, V, C> Clone for ItemCache<K, V, C> {
    fn clone(&self) -> Self {
        ItemCache {
            inner: self.inner.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K, V> ItemCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        ItemCache::with_storage(HashMap::new())
    }
}

impl<K, V> Default for ItemCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        ItemCache::new()
    }
}

impl<K, V, C> ItemCache<K, V, C>
where
    C: Cache<K, V>,
{
    pub fn with_storage(storage: C) -> Self {
        ItemCache {
            inner: Arc::new(Mutex::new(storage)),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().get(key)
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().unwrap().insert(key, value);
    }

    /// Inserts `value` unless `key` already holds one. Returns whether it
    /// was inserted.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        let mut cache = self.inner.lock().unwrap();
        if cache.contains_key(&key) {
            return false;
        }
        cache.insert(key, value);
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let mut cache = self.inner.lock().unwrap();
        for (k, v) in entries {
            cache.insert(k, v);
        }
    }
}

/// Short-lived cache for one inbound request.
///
/// Holds whole lists under a list key (`L`, e.g. "all posts" or "posts of
/// user 3") next to an item table keyed by `K`. Storing a list always
/// indexes its elements into the item table, so single-item loads that
/// share [`RequestCache::items`] are served without another fetch. A miss
/// on an item never triggers a list refetch.
///
/// Create one per request and drop it when the request ends.
pub struct RequestCache<K, V, L = K, C = HashMap<K, V>> {
    lists: Arc<Mutex<HashMap<L, Arc<[V]>>>>,
    items: ItemCache<K, V, C>,
}

// Manual implementation is used to omit applying unnecessary Clone bounds.
impl<K, V, L, C> Clone for RequestCache<K, V, L, C> {
    fn clone(&self) -> Self {
        RequestCache {
            lists: self.lists.clone(),
            items: self.items.clone(),
        }
    }
}

impl<K, V, L> RequestCache<K, V, L>
where
    K: Eq + Hash,
    V: Clone,
    L: Eq + Hash,
{
    pub fn new() -> Self {
        RequestCache::with_items(ItemCache::new())
    }
}

impl<K, V, L> Default for RequestCache<K, V, L>
where
    K: Eq + Hash,
    V: Clone,
    L: Eq + Hash,
{
    fn default() -> Self {
        RequestCache::new()
    }
}

impl<K, V, L, C> RequestCache<K, V, L, C>
where
    V: Clone,
    L: Eq + Hash,
    C: Cache<K, V>,
{
    pub fn with_items(items: ItemCache<K, V, C>) -> Self {
        RequestCache {
            lists: Arc::new(Mutex::new(HashMap::new())),
            items,
        }
    }

    /// The item table, to be shared with a loader via
    /// [`Loader::with_cache`](crate::Loader::with_cache).
    pub fn items(&self) -> ItemCache<K, V, C> {
        self.items.clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.items.get(key)
    }

    pub fn put(&self, key: K, value: V) {
        self.items.put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.items.remove(key)
    }

    pub fn list(&self, list_key: &L) -> Option<Arc<[V]>> {
        self.lists.lock().unwrap().get(list_key).cloned()
    }

    /// Stores `values` under `list_key` and indexes every element into the
    /// item table.
    pub fn put_list(&self, list_key: L, values: Vec<V>) -> Arc<[V]>
    where
        V: Keyed<K>,
    {
        self.items.put_all(values.iter().map(|v| (v.key(), v.clone())));
        let list: Arc<[V]> = values.into();
        self.lists.lock().unwrap().insert(list_key, list.clone());
        list
    }

    /// Returns the list cached under `list_key`, or runs `fetch` and caches
    /// its result. The flag is `true` when the list came from the cache.
    ///
    /// A failed fetch leaves the cache untouched. Misses are not
    /// deduplicated: concurrent misses on the same `list_key` each run their
    /// own fetch, and the last one to finish is what stays cached.
    pub async fn get_or_fetch_list<F, Fut, E>(
        &self,
        list_key: L,
        fetch: F,
    ) -> Result<(Arc<[V]>, bool), E>
    where
        V: Keyed<K>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<V>, E>>,
    {
        if let Some(list) = self.list(&list_key) {
            trace!(len = list.len(), "list served from request cache");
            return Ok((list, true));
        }
        let values = fetch().await?;
        Ok((self.put_list(list_key, values), false))
    }

    /// Drops every list and item.
    pub fn clear(&self) {
        self.lists.lock().unwrap().clear();
        self.items.clear();
    }

    /// Number of cached items, lists not counted.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.lists.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{channel::oneshot, executor::block_on, FutureExt as _};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        id: i64,
        user_id: i64,
    }

    impl Keyed<i64> for Post {
        fn key(&self) -> i64 {
            self.id
        }
    }

    fn posts() -> Vec<Post> {
        vec![
            Post { id: 1, user_id: 1 },
            Post { id: 2, user_id: 1 },
            Post { id: 3, user_id: 2 },
        ]
    }

    #[test]
    fn list_fetch_populates_items() {
        let cache: RequestCache<i64, Post, &'static str> = RequestCache::new();
        let calls = AtomicUsize::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(posts())
        };
        let (list, from_cache) = block_on(cache.get_or_fetch_list("posts", fetch)).unwrap();
        assert!(!from_cache);
        assert_eq!(3, list.len());
        assert_eq!(Some(Post { id: 3, user_id: 2 }), cache.get(&3));
        assert_eq!(3, cache.len());

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec![])
        };
        let (list, from_cache) = block_on(cache.get_or_fetch_list("posts", fetch)).unwrap();
        assert!(from_cache);
        assert_eq!(3, list.len());
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_list_fetch_is_not_cached() {
        let cache: RequestCache<i64, Post, &'static str> = RequestCache::new();
        let ret = block_on(cache.get_or_fetch_list("posts", || async { Err::<Vec<Post>, _>("down") }));
        assert_eq!(Err("down"), ret.map(|(l, _)| l.len()));
        assert!(cache.is_empty());

        let (list, from_cache) =
            block_on(cache.get_or_fetch_list("posts", || async { Ok::<_, &str>(posts()) })).unwrap();
        assert!(!from_cache);
        assert_eq!(3, list.len());
    }

    #[test]
    fn concurrent_list_misses_each_fetch() {
        let cache: RequestCache<i64, Post, &'static str> = RequestCache::new();
        let (open, gate) = oneshot::channel::<()>();

        let mut slow = Box::pin(cache.get_or_fetch_list("posts", move || async move {
            let _ = gate.await;
            Ok::<_, ()>(posts())
        }));
        assert!((&mut slow).now_or_never().is_none());

        let fast = cache.get_or_fetch_list("posts", || async { Ok::<_, ()>(posts()[..1].to_vec()) });
        let (list, from_cache) = block_on(fast).unwrap();
        assert_eq!((1, false), (list.len(), from_cache));

        open.send(()).unwrap();
        let (list, from_cache) = block_on(slow).unwrap();
        assert_eq!((3, false), (list.len(), from_cache));
        assert_eq!(3, cache.list(&"posts").unwrap().len());
    }

    #[test]
    fn lists_are_cached_per_list_key() {
        let cache: RequestCache<i64, Post, Option<i64>> = RequestCache::new();
        cache.put_list(Some(1), posts().into_iter().filter(|p| p.user_id == 1).collect());
        assert!(cache.list(&None).is_none());
        assert_eq!(2, cache.list(&Some(1)).unwrap().len());
        assert_eq!(None, cache.get(&3));
    }

    #[test]
    fn shared_item_table() {
        let cache: RequestCache<i64, Post> = RequestCache::new();
        let items = cache.items();
        items.put(9, Post { id: 9, user_id: 4 });
        assert_eq!(Some(Post { id: 9, user_id: 4 }), cache.get(&9));
        assert!(!items.put_if_absent(9, Post { id: 9, user_id: 5 }));
        assert_eq!(Some(Post { id: 9, user_id: 4 }), cache.remove(&9));
        assert!(items.is_empty());
    }

    #[test]
    fn btree_storage() {
        let items: ItemCache<i64, Post, BTreeMap<i64, Post>> = ItemCache::with_storage(BTreeMap::new());
        let cache: RequestCache<i64, Post, (), _> = RequestCache::with_items(items);
        cache.put_list((), posts());
        assert_eq!(3, cache.len());
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.list(&()).is_none());
    }
}
