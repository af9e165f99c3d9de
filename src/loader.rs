use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{self, AbortHandle, AbortRegistration, Abortable, Aborted, BoxFuture, Shared},
    FutureExt as _,
};
use indexmap::IndexMap;
use tracing::{debug, error, trace, warn};

use crate::{
    cache::{Cache, ItemCache},
    runtime::yield_now,
    BatchFn, LoadError,
};

type BatchId = u64;
type Outcome<V, E> = Result<V, LoadError<E>>;
type Waiter<V, E> = oneshot::Sender<Outcome<V, E>>;
type Fetched<V, E> = Result<Vec<Result<V, E>>, E>;

struct InFlight<V, E> {
    batch: BatchId,
    waiters: Vec<Waiter<V, E>>,
}

struct Running {
    abort: AbortHandle,
    driver: Weak<Driver>,
}

/// Fetches of one batch generation, shared by the self-dispatching handles
/// waiting on them so any surviving handle can keep driving them.
#[derive(Default)]
struct Driver {
    batches: Mutex<Vec<Shared<BoxFuture<'static, ()>>>>,
}

impl Driver {
    fn batches(&self) -> Vec<Shared<BoxFuture<'static, ()>>> {
        self.batches.lock().unwrap().clone()
    }
}

struct State<K, V, E> {
    // unique keys of the open batch, first-seen order
    open: IndexMap<K, Vec<Waiter<V, E>>>,
    // only handles keep a driver alive
    open_driver: Weak<Driver>,
    in_flight: HashMap<K, InFlight<V, E>>,
    batches: HashMap<BatchId, Running>,
    batch_seq: BatchId,
    max_batch_size: usize,
    yield_count: Option<usize>,
    cancelled: bool,
}

impl<K, V, E> State<K, V, E>
where
    K: Eq + Hash,
{
    fn new() -> Self {
        State {
            open: IndexMap::new(),
            open_driver: Weak::new(),
            in_flight: HashMap::new(),
            batches: HashMap::new(),
            batch_seq: 0,
            max_batch_size: usize::MAX,
            yield_count: None,
            cancelled: false,
        }
    }

    fn next_batch_id(&mut self) -> BatchId {
        self.batch_seq = self.batch_seq.wrapping_add(1);
        self.batch_seq
    }

    fn open_driver(&mut self) -> Arc<Driver> {
        match self.open_driver.upgrade() {
            Some(driver) => driver,
            None => {
                let driver = Arc::new(Driver::default());
                self.open_driver = Arc::downgrade(&driver);
                driver
            }
        }
    }

    fn take_waiters(&mut self, key: &K, batch: BatchId) -> Vec<Waiter<V, E>> {
        match self.in_flight.get(key) {
            Some(entry) if entry.batch == batch => self
                .in_flight
                .remove(key)
                .map(|entry| entry.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

struct Inner<K, V, F, C>
where
    F: BatchFn<K, V>,
{
    state: Mutex<State<K, V, F::Error>>,
    batch_fn: F,
    cache: ItemCache<K, V, C>,
}

/// Batching, deduplicating loader for one request scope.
///
/// [`load`](Loader::load) registers the key right away; the batch it lands
/// in is dispatched by [`flush`](Loader::flush), by a
/// [`RequestScope`](crate::RequestScope) driving the resolution, or, with
/// [`with_yield_count`](Loader::with_yield_count), by the first handle
/// that gets awaited.
pub struct Loader<K, V, F, C = HashMap<K, V>>
where
    F: BatchFn<K, V>,
{
    inner: Arc<Inner<K, V, F, C>>,
}

// Manual implementation is used to omit applying unnecessary Clone bounds.
impl<K, V, F, C> Clone for Loader<K, V, F, C>
where
    F: BatchFn<K, V>,
{
    fn clone(&self) -> Self {
        Loader {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, F> Loader<K, V, F>
where
    K: Eq + Hash,
    V: Clone,
    F: BatchFn<K, V>,
{
    pub fn new(batch_fn: F) -> Self {
        Loader::with_cache(batch_fn, ItemCache::new())
    }
}

impl<K, V, F, C> Loader<K, V, F, C>
where
    K: Eq + Hash,
    F: BatchFn<K, V>,
{
    /// Uses `cache` as the table of resolved values, typically the item
    /// table of a [`RequestCache`](crate::RequestCache).
    pub fn with_cache(batch_fn: F, cache: ItemCache<K, V, C>) -> Self {
        Loader {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
                batch_fn,
                cache,
            }),
        }
    }

    /// Splits a flushed batch into fetches of at most `max_batch_size` keys.
    ///
    /// The setting is shared by every clone of the loader, including the one
    /// held by a [`RequestScope`](crate::RequestScope).
    pub fn with_max_batch_size(self, max_batch_size: usize) -> Self {
        self.inner.state.lock().unwrap().max_batch_size = max_batch_size.max(1);
        self
    }

    /// Makes handles dispatch their own batch: on first poll a handle yields
    /// to the runtime `yield_count` times, so sibling loads can join the
    /// batch, then flushes it. A running fetch is driven by whichever of its
    /// handles is still polled, so dropping one handle does not fail the
    /// others.
    pub fn with_yield_count(self, yield_count: usize) -> Self {
        self.inner.state.lock().unwrap().yield_count = Some(yield_count);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.inner.state.lock().unwrap().max_batch_size
    }
}

impl<K, V, F, C> Loader<K, V, F, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V> + Send + Sync + 'static,
    F::Error: Clone + Send + Sync + 'static,
    C: Cache<K, V> + Send + 'static,
{
    pub fn load(&self, key: K) -> LoadHandle<V, F::Error> {
        let mut state = self.inner.state.lock().unwrap();
        if state.cancelled {
            return LoadHandle::ready(Err(LoadError::Cancelled));
        }
        if let Some(value) = self.inner.cache.get(&key) {
            trace!(?key, "load served from cache");
            return LoadHandle::ready(Ok(value));
        }

        let (tx, rx) = oneshot::channel();
        let yield_count = state.yield_count;
        let driver = if let Some(entry) = state.in_flight.get_mut(&key) {
            trace!(?key, batch = entry.batch, "load attached to in-flight fetch");
            entry.waiters.push(tx);
            let batch = entry.batch;
            state
                .batches
                .get(&batch)
                .and_then(|running| running.driver.upgrade())
        } else {
            state.open.entry(key).or_default().push(tx);
            yield_count.map(|_| state.open_driver())
        };
        drop(state);

        LoadHandle {
            slot: Slot::Waiting(rx),
            kick: yield_count.map(|count| self.kick(count, driver.unwrap_or_default())),
        }
    }

    pub fn load_many(
        &self,
        keys: Vec<K>,
    ) -> impl Future<Output = Vec<Result<V, LoadError<F::Error>>>> {
        future::join_all(keys.into_iter().map(|key| self.load(key)))
    }

    pub fn try_load_many(
        &self,
        keys: Vec<K>,
    ) -> impl Future<Output = Result<Vec<V>, LoadError<F::Error>>> {
        future::try_join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Closes the open batch and waits until every fetch it turned into has
    /// resolved its waiters. Does nothing when no key is pending.
    pub async fn flush(&self) {
        future::join_all(self.take_batches()).await;
    }

    /// Number of unique keys waiting in the open batch.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().unwrap().open.len()
    }

    /// Seeds the cache with `value` unless `key` already resolved.
    pub fn prime(&self, key: K, value: V) -> bool {
        self.inner.cache.put_if_absent(key, value)
    }

    /// Drops the cached value of `key`; the next load fetches it again.
    pub fn forget(&self, key: &K) -> Option<V> {
        self.inner.cache.remove(key)
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    pub fn cache(&self) -> ItemCache<K, V, C> {
        self.inner.cache.clone()
    }

    /// Rejects every open and in-flight waiter with
    /// [`LoadError::Cancelled`] and aborts running fetches. Later loads
    /// resolve to `Cancelled` immediately.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.cancelled = true;
        for (_, running) in state.batches.drain() {
            running.abort.abort();
        }
        let mut waiters = state
            .open
            .drain(..)
            .flat_map(|(_, waiters)| waiters)
            .collect::<Vec<_>>();
        waiters.extend(state.in_flight.drain().flat_map(|(_, entry)| entry.waiters));
        drop(state);

        debug!(waiters = waiters.len(), "loader cancelled");
        resolve(waiters, Err(LoadError::Cancelled));
    }

    pub(crate) fn take_batches(&self) -> Vec<BoxFuture<'static, ()>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.open.is_empty() {
            return Vec::new();
        }
        let open = std::mem::take(&mut state.open);
        let driver = std::mem::take(&mut state.open_driver);
        let shared = driver.upgrade();
        let max_batch_size = state.max_batch_size;

        let mut batches = Vec::new();
        let mut entries = open.into_iter().peekable();
        while entries.peek().is_some() {
            let id = state.next_batch_id();
            let mut keys = Vec::new();
            for (key, waiters) in entries.by_ref().take(max_batch_size) {
                state
                    .in_flight
                    .insert(key.clone(), InFlight { batch: id, waiters });
                keys.push(key);
            }
            let (abort, registration) = AbortHandle::new_pair();
            state.batches.insert(
                id,
                Running {
                    abort,
                    driver: driver.clone(),
                },
            );
            let fetch = self.dispatch(id, keys, registration);
            match &shared {
                Some(shared) => {
                    let fetch = fetch.shared();
                    shared.batches.lock().unwrap().push(fetch.clone());
                    batches.push(fetch.boxed());
                }
                None => batches.push(fetch),
            }
        }
        drop(state);
        batches
    }

    fn dispatch(
        &self,
        id: BatchId,
        keys: Vec<K>,
        registration: AbortRegistration,
    ) -> BoxFuture<'static, ()> {
        debug!(batch = id, size = keys.len(), ?keys, "dispatching batch");
        let inner = self.inner.clone();
        let abandoned = self.inner.clone();
        // armed before the first poll: an unpolled batch must not wedge its keys
        let mut guard = OnDrop::new(move || abandoned.fail_batch(id));
        async move {
            let outcome = Abortable::new(inner.batch_fn.load(&keys), registration).await;
            guard.disarm();
            inner.complete(id, keys, outcome);
        }
        .boxed()
    }

    fn kick(&self, yield_count: usize, driver: Arc<Driver>) -> BoxFuture<'static, ()> {
        let loader = self.clone();
        async move {
            // yield for other load to append request
            for _ in 0..yield_count {
                yield_now().await;
            }
            let taken = future::join_all(loader.take_batches());
            let running = future::join_all(driver.batches());
            future::join(taken, running).await;
        }
        .boxed()
    }
}

impl<K, V, F, C> Inner<K, V, F, C>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
    F: BatchFn<K, V>,
    F::Error: Clone,
    C: Cache<K, V>,
{
    fn complete(&self, id: BatchId, keys: Vec<K>, outcome: Result<Fetched<V, F::Error>, Aborted>) {
        let mut state = self.state.lock().unwrap();
        state.batches.remove(&id);
        let waiters = keys
            .iter()
            .map(|key| state.take_waiters(key, id))
            .collect::<Vec<_>>();

        let deliveries = match outcome {
            Err(Aborted) => waiters
                .into_iter()
                .map(|w| (w, Err(LoadError::Cancelled)))
                .collect::<Vec<_>>(),
            Ok(Err(e)) => {
                warn!(batch = id, size = keys.len(), "batch fetch failed");
                waiters
                    .into_iter()
                    .map(|w| (w, Err(LoadError::Fetch(e.clone()))))
                    .collect()
            }
            Ok(Ok(values)) if values.len() != keys.len() => {
                error!(
                    batch = id,
                    expected = keys.len(),
                    actual = values.len(),
                    "batch function broke the result alignment contract"
                );
                let err = LoadError::Consistency {
                    expected: keys.len(),
                    actual: values.len(),
                };
                waiters.into_iter().map(|w| (w, Err(err.clone()))).collect()
            }
            Ok(Ok(values)) => keys
                .into_iter()
                .zip(values)
                .zip(waiters)
                .map(|((key, value), w)| match value {
                    Ok(value) => {
                        if !state.cancelled {
                            self.cache.put(key, value.clone());
                        }
                        (w, Ok(value))
                    }
                    Err(e) => {
                        trace!(?key, batch = id, "key failed");
                        (w, Err(LoadError::Key(e)))
                    }
                })
                .collect(),
        };
        drop(state);

        for (waiters, outcome) in deliveries {
            resolve(waiters, outcome);
        }
    }

    // A batch future dropped before its fetch finished leaves its waiters
    // without a result; reject them instead of leaving them pending.
    fn fail_batch(&self, id: BatchId) {
        let mut state = self.state.lock().unwrap();
        if state.batches.remove(&id).is_none() {
            return;
        }
        let mut waiters = Vec::new();
        state.in_flight.retain(|_, entry| {
            if entry.batch == id {
                waiters.append(&mut entry.waiters);
                false
            } else {
                true
            }
        });
        drop(state);

        debug!(batch = id, waiters = waiters.len(), "batch abandoned before completion");
        resolve(waiters, Err(LoadError::Cancelled));
    }
}

fn resolve<V: Clone, E: Clone>(waiters: Vec<Waiter<V, E>>, outcome: Outcome<V, E>) {
    for waiter in waiters {
        // receiver gone means the caller stopped waiting
        let _ = waiter.send(outcome.clone());
    }
}

struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    fn new(f: F) -> Self {
        OnDrop(Some(f))
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// The future returned by [`Loader::load`].
///
/// Every handle of the same key resolves to a clone of the same outcome. A
/// handle whose loader went away without answering resolves to
/// [`LoadError::Cancelled`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct LoadHandle<V, E> {
    slot: Slot<V, E>,
    kick: Option<BoxFuture<'static, ()>>,
}

enum Slot<V, E> {
    Ready(future::Ready<Outcome<V, E>>),
    Waiting(oneshot::Receiver<Outcome<V, E>>),
}

impl<V, E> LoadHandle<V, E> {
    fn ready(outcome: Outcome<V, E>) -> Self {
        LoadHandle {
            slot: Slot::Ready(future::ready(outcome)),
            kick: None,
        }
    }
}

impl<V, E> Future for LoadHandle<V, E> {
    type Output = Result<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(kick) = this.kick.as_mut() {
            if kick.poll_unpin(cx).is_pending() {
                return Poll::Pending;
            }
            this.kick = None;
        }
        match &mut this.slot {
            Slot::Ready(ready) => ready.poll_unpin(cx),
            Slot::Waiting(rx) => rx
                .poll_unpin(cx)
                .map(|received| received.unwrap_or(Err(LoadError::Cancelled))),
        }
    }
}

pub(crate) trait Dispatch: Send + Sync {
    fn close_batch(&self) -> Vec<BoxFuture<'static, ()>>;
    fn cancel_all(&self);
}

impl<K, V, F, C> Dispatch for Loader<K, V, F, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V> + Send + Sync + 'static,
    F::Error: Clone + Send + Sync + 'static,
    C: Cache<K, V> + Send + 'static,
{
    fn close_batch(&self) -> Vec<BoxFuture<'static, ()>> {
        self.take_batches()
    }

    fn cancel_all(&self) {
        self.cancel();
    }
}
