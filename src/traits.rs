use async_trait::async_trait;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::LoadError;

/// The caller-supplied side of a [`Loader`](crate::Loader): fetches many keys at once.
///
/// Like a data controller of a cache, the implementing type defines the `Key`, `Value`, and `Error` types the loader
/// operates with.
#[async_trait]
pub trait BatchFn: Sized + Send + Sync + 'static {
    /// The key type to be used with [`Loader::load()`](crate::Loader::load).
    ///
    /// To load different kinds of records through one loader you can use an enum as the key type.
    type Key: Debug + Hash + Clone + Eq + Sized + Send + Sync + 'static;
    type Value: Debug + Clone + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    /// Load values for `keys`.
    ///
    /// The returned vector must have exactly one element per key and in the same order: element `i` is the outcome for
    /// `keys[i]`. An `Err` element fails only its own key. Returning `Err` for the whole call fails every key of the
    /// batch.
    async fn load(&self, keys: &[Self::Key]) -> Result<Vec<Result<Self::Value, Self::Error>>, Self::Error>;
}

/// Hooks into loader activity. All methods default to doing nothing.
///
/// Every dispatched batch is reported by `on_dispatch`; every failure by exactly one of `on_key_error`,
/// `on_batch_error` or `on_cancel`.
#[async_trait]
pub trait Observer<B>: Send + Sync + 'static
where
    B: BatchFn,
{
    /// Called right before the batch function is invoked.
    async fn on_dispatch(&self, _batch_id: u64, _keys: &[B::Key]) {}
    async fn on_key_error(&self, _key: &B::Key, _error: &Arc<B::Error>) {}
    /// Called when a batch is rejected as a whole.
    async fn on_batch_error(&self, _keys: &[B::Key], _error: &LoadError<B::Error>) {}
    /// Called when a batch is rejected with [`LoadError::Cancelled`]: the batch function panicked, or the dispatch was
    /// dropped before running. Invoked from a `drop`, hence synchronous; must not block.
    fn on_cancel(&self, _batch_id: u64, _keys: &[B::Key]) {}
}
