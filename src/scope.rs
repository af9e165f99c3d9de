use std::{
    fmt::Debug,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
    task::Poll,
};

use futures::{
    future::{self, BoxFuture},
    stream::FuturesUnordered,
    StreamExt as _,
};
use tracing::{debug, trace};

use crate::{cache::Cache, loader::Dispatch, BatchFn, Loader};

struct ScopeState {
    loaders: Vec<Arc<dyn Dispatch>>,
    aborted: bool,
}

struct ScopeInner {
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    fn abort(&self) {
        let loaders = {
            let mut state = self.state.lock().unwrap();
            if state.aborted {
                return;
            }
            state.aborted = true;
            std::mem::take(&mut state.loaders)
        };
        debug!(loaders = loaders.len(), "request scope aborted");
        for loader in loaders {
            loader.cancel_all();
        }
    }

    fn loaders(&self) -> Vec<Arc<dyn Dispatch>> {
        self.state.lock().unwrap().loaders.clone()
    }
}

/// Lifetime of one inbound request.
///
/// Owns the scheduling boundary of the loaders attached to it:
/// [`run`](RequestScope::run) polls the resolution future and, every time it
/// stalls, closes the open batch of every attached loader and drives the
/// resulting fetches. All loads issued during one poll therefore share a
/// batch.
///
/// Dropping the scope aborts it: outstanding handles resolve to
/// [`LoadError::Cancelled`](crate::LoadError::Cancelled).
pub struct RequestScope {
    inner: Arc<ScopeInner>,
}

impl Default for RequestScope {
    fn default() -> Self {
        RequestScope::new()
    }
}

impl RequestScope {
    pub fn new() -> Self {
        RequestScope {
            inner: Arc::new(ScopeInner {
                state: Mutex::new(ScopeState {
                    loaders: Vec::new(),
                    aborted: false,
                }),
            }),
        }
    }

    /// Creates a loader and attaches it to this scope.
    pub fn loader<K, V, F>(&self, batch_fn: F) -> Loader<K, V, F>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: BatchFn<K, V> + Send + Sync + 'static,
        F::Error: Clone + Send + Sync + 'static,
    {
        let loader = Loader::new(batch_fn);
        self.attach(&loader);
        loader
    }

    /// Puts `loader` under this scope's flushing and cancellation. A loader
    /// attached to an already aborted scope is cancelled on the spot.
    pub fn attach<K, V, F, C>(&self, loader: &Loader<K, V, F, C>)
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: BatchFn<K, V> + Send + Sync + 'static,
        F::Error: Clone + Send + Sync + 'static,
        C: Cache<K, V> + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.aborted {
            drop(state);
            loader.cancel();
            return;
        }
        state.loaders.push(Arc::new(loader.clone()));
    }

    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().unwrap().aborted
    }

    /// A handle able to abort this scope from another task.
    pub fn abort_handle(&self) -> AbortScope {
        AbortScope {
            inner: self.inner.clone(),
        }
    }

    /// Closes the open batch of every attached loader and waits for the
    /// fetches to finish.
    pub async fn flush(&self) {
        future::join_all(self.close_batches()).await;
    }

    /// Drives `fut` to completion, dispatching open batches whenever it
    /// cannot make progress.
    ///
    /// Fetches still running when `fut` completes are dropped, and their
    /// remaining waiters resolve to `Cancelled`.
    pub async fn run<Fut: Future>(&self, fut: Fut) -> Fut::Output {
        let mut fut = std::pin::pin!(fut);
        let mut in_flight = FuturesUnordered::new();
        let mut round = 0usize;
        future::poll_fn(|cx| loop {
            if let Poll::Ready(output) = fut.as_mut().poll(cx) {
                return Poll::Ready(output);
            }
            let batches = self.close_batches();
            let dispatched = !batches.is_empty();
            if dispatched {
                round += 1;
                trace!(round, batches = batches.len(), "resolution round closed");
            }
            in_flight.extend(batches);
            while let Poll::Ready(Some(())) = in_flight.poll_next_unpin(cx) {}
            if !dispatched {
                return Poll::Pending;
            }
        })
        .await
    }

    fn close_batches(&self) -> Vec<BoxFuture<'static, ()>> {
        self.inner
            .loaders()
            .iter()
            .flat_map(|loader| loader.close_batch())
            .collect()
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Cloneable handle aborting a [`RequestScope`].
#[derive(Clone)]
pub struct AbortScope {
    inner: Arc<ScopeInner>,
}

impl AbortScope {
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().unwrap().aborted
    }
}
