use thiserror::Error;

/// Error delivered to a waiter of [`Loader::load`](crate::Loader::load).
///
/// Every waiter attached to the same key receives an identical clone, so
/// `E` has to be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function failed as a whole; every key of the batch fails.
    #[error("batch fetch failed: {0}")]
    Fetch(E),

    /// The batch function flagged this particular key as failed.
    #[error("lookup failed: {0}")]
    Key(E),

    /// The batch function returned a result sequence that does not line up
    /// with the keys it was given.
    #[error("batch function returned {actual} results for {expected} keys")]
    Consistency { expected: usize, actual: usize },

    /// The owning request scope was aborted or dropped before the key
    /// resolved.
    #[error("request scope cancelled")]
    Cancelled,
}

impl<E> LoadError<E> {
    /// The upstream error carried by `Fetch` and `Key`, if any.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(e) | LoadError::Key(e) => Some(e),
            LoadError::Consistency { .. } | LoadError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}
