//! # kb-loader
//!
//! Key batching loader: collects the keys requested one by one during a short scheduling window, fetches them with a
//! single call of a user-supplied batch function, and memoizes the outcome of every key.
//!
//! Think of it as a request collapser placed in front of a backend which is cheaper to query for many records at once
//! than for each record separately.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Key-indexed records; e.g., database rows, documents behind an HTTP API, entries of a remote cache.
//! - Code which naturally asks for one record at a time, like resolvers of a graph of objects.
//! - A backend where one round trip for N keys is much cheaper than N round trips.
//!
//! The loader operates on the following principles:
//!
//! - It is backend-agnostic and key and value agnostic; the [`BatchFn`] implementation defines the `Key`, `Value`, and
//!   `Error` types.
//! - [`Loader::load()`] never waits. It returns a [`Slot`](slot::Slot), a single-assignment placeholder which can be
//!   awaited. Everybody asking for the same key gets the same slot.
//! - The moment a batch is sent is decided by a [`Scheduler`](scheduler::Scheduler): right after the current task
//!   yields by default, after a fixed delay, on a manual flush, or by any closure. The window can also be held open
//!   explicitly with [`Loader::hold_window()`].
//! - With the built-in time-based schedulers the loader must be used within a Tokio runtime.
//! - Outcomes are cached until explicitly cleared. Per-key errors are cached too; failures of a whole batch are not.
//! - Fully async, on top of Tokio.
//!
//! ```ignore
//! struct Users(Client);
//!
//! #[async_trait]
//! impl BatchFn for Users {
//!     type Key = u64;
//!     type Value = User;
//!     type Error = ClientError;
//!
//!     async fn load(&self, keys: &[u64]) -> Result<Vec<Result<User, ClientError>>, ClientError> {
//!         let mut found = self.0.fetch_users(keys).await?;
//!         Ok(keys.iter().map(|id| found.remove(id).ok_or(ClientError::NotFound(*id))).collect())
//!     }
//! }
//!
//! let loader = Loader::new(Users(client));
//! let (author, reviewer) = (loader.load(10), loader.load(20));
//! // One call of Users::load() with [10, 20].
//! let author = author.await?;
//! ```
//!
//! # Batch Function Contract
//!
//! The batch function receives the keys of a batch in the order they were first requested and must return exactly one
//! result per key, positionally. A result vector of a different length fails the whole batch with
//! [`LoadError::Contract`](error::LoadError::Contract). An `Err` element fails only its key; an `Err` returned for the
//! whole call fails all keys of the batch with [`LoadError::Batch`](error::LoadError::Batch).

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod scheduler;
pub mod slot;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use loader::Loader;
#[doc(inline)]
pub use traits::BatchFn;

pub mod prelude {
    pub use crate::cache::BoundedCache;
    pub use crate::cache::CacheFactory;
    pub use crate::cache::CacheMap;
    pub use crate::cache::HashMapCache;
    pub use crate::cache::NoCache;
    pub use crate::config::LoaderConfig;
    pub use crate::error::LoadError;
    pub use crate::loader::LoadMany;
    pub use crate::loader::Loader;
    pub use crate::loader::LoaderBuilder;
    pub use crate::loader::WindowHold;
    pub use crate::scheduler::Delay;
    pub use crate::scheduler::Dispatch;
    pub use crate::scheduler::Manual;
    pub use crate::scheduler::Scheduler;
    pub use crate::scheduler::Tick;
    pub use crate::slot::Slot;
    pub use crate::slot::SlotState;
    pub use crate::traits::BatchFn;
    pub use crate::traits::Observer;
    pub use crate::types::*;
}
