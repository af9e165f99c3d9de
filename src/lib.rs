//! Request-scoped batching loader.
//!
//! A [`Loader`] collects the individual key lookups issued while one request
//! is being resolved, coalesces them into as few upstream fetches as
//! possible through a [`BatchFn`], and hands every caller its own result.
//! Resolved values land in a per-request cache so repeated lookups never
//! reach the upstream twice; failures are never cached.
//!
//! ```ignore
//! let scope = RequestScope::new();
//! let cache: RequestCache<i64, User> = RequestCache::new();
//! let users = Loader::with_cache(UserBatcher, cache.items());
//! scope.attach(&users);
//!
//! let (a, b) = scope.run(futures::future::join(users.load(1), users.load(2))).await;
//! ```

mod batch_fn;
pub mod cache;
mod error;
mod loader;
mod runtime;
mod scope;

#[cfg(test)]
mod tests;

pub use batch_fn::{align_by_key, batch_fn, BatchFn, FnBatch};
pub use cache::{Cache, ItemCache, Keyed, RequestCache};
pub use error::LoadError;
pub use loader::{LoadHandle, Loader};
pub use scope::{AbortScope, RequestScope};
