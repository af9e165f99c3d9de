use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use async_trait::async_trait;

use crate::cache::Keyed;

/// The upstream contract of a [`Loader`](crate::Loader).
///
/// `load` receives the unique keys of one batch in first-seen order and
/// returns one result per key, in the same order. Returning a sequence of a
/// different length is a contract violation surfaced to every waiter as
/// [`LoadError::Consistency`](crate::LoadError::Consistency). Returning `Err`
/// fails the whole batch.
#[async_trait]
pub trait BatchFn<K, V> {
    type Error;

    async fn load(&self, keys: &[K]) -> Result<Vec<Result<V, Self::Error>>, Self::Error>;
}

/// Adapts a closure taking an owned key batch into a [`BatchFn`].
pub struct FnBatch<F>(F);

pub fn batch_fn<F>(f: F) -> FnBatch<F> {
    FnBatch(f)
}

#[async_trait]
impl<K, V, E, F, Fut> BatchFn<K, V> for FnBatch<F>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
    E: Send + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Result<V, E>>, E>> + Send + 'static,
{
    type Error = E;

    async fn load(&self, keys: &[K]) -> Result<Vec<Result<V, E>>, E> {
        (self.0)(keys.to_vec()).await
    }
}

/// Lines up an unordered upstream response with the requested keys.
///
/// Bulk endpoints usually answer `?id=1&id=2&id=3` with the entities they
/// found, in whatever order, skipping unknown ids. Keys without a matching
/// value get `missing(key)`.
pub fn align_by_key<K, V, E>(
    keys: &[K],
    values: Vec<V>,
    mut missing: impl FnMut(&K) -> E,
) -> Vec<Result<V, E>>
where
    K: Eq + Hash,
    V: Keyed<K> + Clone,
{
    let by_key = values
        .into_iter()
        .map(|v| (v.key(), v))
        .collect::<HashMap<_, _>>();
    keys.iter()
        .map(|k| by_key.get(k).cloned().ok_or_else(|| missing(k)))
        .collect()
}
