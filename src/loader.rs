use std::fmt::Debug;
use std::future::Future;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::cache::CacheFactory;
use crate::cache::CacheMap;
use crate::cache::HashMapCache;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::scheduler::Dispatch;
use crate::scheduler::Scheduler;
use crate::scheduler::Tick;
use crate::slot::Slot;
use crate::traits::BatchFn;
use crate::traits::Observer;
use crate::types::LoadResult;
use crate::types::LoaderStats;
use crate::types::StatCounters;

/// The slot type of a loader over batch function `B`.
pub type SlotOf<B> = Slot<<B as BatchFn>::Value, <B as BatchFn>::Error>;

type CacheOf<B> = Box<dyn CacheMap<<B as BatchFn>::Key, SlotOf<B>>>;
type CacheMaker<B> = Box<dyn FnOnce(&str) -> CacheOf<B> + Send>;

struct Batch<B>
where
    B: BatchFn,
{
    id:    u64,
    keys:  Vec<B::Key>,
    slots: Vec<SlotOf<B>>,
}

impl<B> Batch<B>
where
    B: BatchFn,
{
    fn new(id: u64) -> Self {
        Self {
            id,
            keys: Vec::new(),
            slots: Vec::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn reject(&self, error: &LoadError<B::Error>) {
        for slot in &self.slots {
            slot.reject(error.clone());
        }
    }
}

struct LoaderState<B>
where
    B: BatchFn,
{
    cache:         CacheOf<B>,
    // The batch collecting new requests.
    open:          Option<Batch<B>>,
    // Batches which reached the size limit but their dispatches haven't run yet.
    sealed:        Vec<Batch<B>>,
    next_batch_id: u64,
}

impl<B> LoaderState<B>
where
    B: BatchFn,
{
    fn new(cache: CacheOf<B>) -> Self {
        Self {
            cache,
            open: None,
            sealed: Vec::new(),
            next_batch_id: 0,
        }
    }

    // Returns the id of the batch if the request opened a new one. Such batch needs a dispatch.
    fn enqueue(&mut self, key: B::Key, slot: SlotOf<B>, limit: usize) -> Option<u64> {
        let mut opened = None;

        if self.open.is_none() {
            let id = self.next_batch_id;
            self.next_batch_id += 1;
            self.open = Some(Batch::new(id));
            opened = Some(id);
        }

        if let Some(batch) = self.open.as_mut() {
            batch.keys.push(key);
            batch.slots.push(slot);
            if batch.len() >= limit {
                if let Some(full) = self.open.take() {
                    trace!(batch = full.id, size = full.len(), "batch sealed by size limit");
                    self.sealed.push(full);
                }
            }
        }

        opened
    }

    fn take_batch(&mut self, id: u64) -> Option<Batch<B>> {
        if self.open.as_ref().is_some_and(|b| b.id == id) {
            return self.open.take();
        }
        let idx = self.sealed.iter().position(|b| b.id == id)?;
        Some(self.sealed.remove(idx))
    }

    // Only entries still holding the batch's own slots are removed. A key could have been cleared and loaded or primed
    // again while the batch was in flight.
    fn evict(&mut self, batch: &Batch<B>) {
        for (key, slot) in batch.keys.iter().zip(batch.slots.iter()) {
            if self.cache.get(key).is_some_and(|cached| cached.ptr_eq(slot)) {
                self.cache.remove(key);
            }
        }
    }
}

struct LoaderInner<B>
where
    B: BatchFn,
{
    name:      Arc<str>,
    config:    LoaderConfig,
    batch_fn:  B,
    scheduler: Box<dyn Scheduler>,
    observer:  Option<Box<dyn Observer<B>>>,
    state:     Mutex<LoaderState<B>>,
    // Number of active window holds. Dispatches wait for it to drop to zero.
    holds:     watch::Sender<usize>,
    stats:     StatCounters,
}

impl<B> LoaderInner<B>
where
    B: BatchFn,
{
    #[instrument(level = "trace", skip(self), fields(loader = %self.name))]
    async fn dispatch(&self, batch_id: u64) {
        // Bursts holding the window open go first. The sender lives in self, waiting can't fail.
        let mut holds = self.holds.subscribe();
        let _ = holds.wait_for(|count| *count == 0).await;

        let Some(batch) = self.state.lock().take_batch(batch_id)
        else {
            trace!(batch = batch_id, "batch is already dispatched");
            return;
        };

        debug!(loader = %self.name, batch = batch_id, size = batch.len(), "dispatching batch");
        self.stats.batch_dispatched();

        let guard = BatchGuard {
            inner: self,
            batch: Some(batch),
        };

        if let Some(observer) = &self.observer {
            observer.on_dispatch(batch_id, guard.keys()).await;
        }

        let outcome = self.batch_fn.load(guard.keys()).await;
        match outcome {
            Ok(values) if values.len() == guard.len() => self.deliver(guard, values).await,
            Ok(values) => {
                let error = LoadError::Contract {
                    expected: guard.len(),
                    got:      values.len(),
                };
                self.fail(guard, error).await
            }
            Err(error) => self.fail(guard, LoadError::Batch(Arc::new(error))).await,
        }
    }

    async fn deliver(&self, guard: BatchGuard<'_, B>, values: Vec<Result<B::Value, B::Error>>) {
        let Some(batch) = guard.disarm()
        else {
            return;
        };

        let mut key_errors = Vec::new();
        for ((key, slot), value) in batch.keys.into_iter().zip(batch.slots).zip(values) {
            match value {
                Ok(value) => {
                    slot.resolve(value);
                }
                Err(error) => {
                    let error = Arc::new(error);
                    debug!(loader = %self.name, batch = batch.id, ?key, %error, "key failed");
                    slot.reject(LoadError::Key(Arc::clone(&error)));
                    key_errors.push((key, error));
                }
            }
        }

        if let Some(observer) = &self.observer {
            for (key, error) in &key_errors {
                observer.on_key_error(key, error).await;
            }
        }
    }

    async fn fail(&self, guard: BatchGuard<'_, B>, error: LoadError<B::Error>) {
        let Some(batch) = guard.disarm()
        else {
            return;
        };

        self.reject_batch(&batch, &error);

        if let Some(observer) = &self.observer {
            observer.on_batch_error(&batch.keys, &error).await;
        }
    }

    fn reject_batch(&self, batch: &Batch<B>, error: &LoadError<B::Error>) {
        debug!(loader = %self.name, batch = batch.id, size = batch.len(), %error, "batch failed");
        // Evict first so that a caller woken up by the rejection can retry right away.
        self.state.lock().evict(batch);
        batch.reject(error);
        self.stats.batch_failed();
    }

    fn notify_cancel(&self, batch: &Batch<B>) {
        if let Some(observer) = &self.observer {
            observer.on_cancel(batch.id, &batch.keys);
        }
    }
}

impl<B> Drop for LoaderInner<B>
where
    B: BatchFn,
{
    // Only reachable with undispatched batches if their dispatches were dropped without being run.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let leftover = state.open.take().into_iter().chain(state.sealed.drain(..)).collect::<Vec<_>>();
        for batch in leftover {
            debug!(loader = %self.name, batch = batch.id, size = batch.len(), "batch cancelled with its loader");
            batch.reject(&LoadError::Cancelled);
            self.notify_cancel(&batch);
        }
    }
}

// Owns a batch taken out of the loader state. If dropped while still armed, i.e. the batch function panicked or the
// dispatch future was dropped, the batch gets cancelled.
struct BatchGuard<'a, B>
where
    B: BatchFn,
{
    inner: &'a LoaderInner<B>,
    batch: Option<Batch<B>>,
}

impl<B> BatchGuard<'_, B>
where
    B: BatchFn,
{
    fn keys(&self) -> &[B::Key] {
        self.batch.as_ref().map_or(&[], |b| b.keys.as_slice())
    }

    fn len(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.len())
    }

    fn disarm(mut self) -> Option<Batch<B>> {
        self.batch.take()
    }
}

impl<B> Drop for BatchGuard<'_, B>
where
    B: BatchFn,
{
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            self.inner.reject_batch(&batch, &LoadError::Cancelled);
            self.inner.notify_cancel(&batch);
        }
    }
}

/// Batches and memoizes loads of individual keys.
///
/// ```ignore
/// let loader = Loader::builder(UserService::new(client))
///     .config(LoaderConfig::builder().name("users").max_batch_size(100).build()?)
///     .build();
///
/// // Both end up in a single call of UserService::load().
/// let (alice, bob) = (loader.load(alice_id), loader.load(bob_id));
/// let alice = alice.await?;
/// let bob = bob.await?;
/// ```
///
/// Cloning a loader is cheap; all clones share the same cache and batches.
pub struct Loader<B>
where
    B: BatchFn,
{
    inner: Arc<LoaderInner<B>>,
}

impl<B> Loader<B>
where
    B: BatchFn,
{
    /// A loader with default configuration, [`Tick`] scheduling, and an unbounded cache.
    ///
    /// With [`Tick`] or [`Delay`](crate::scheduler::Delay) scheduling the loader must be used within a Tokio runtime.
    pub fn new(batch_fn: B) -> Self {
        Self::builder(batch_fn).build()
    }

    pub fn builder(batch_fn: B) -> LoaderBuilder<B> {
        LoaderBuilder {
            batch_fn,
            config: None,
            scheduler: None,
            cache: None,
            observer: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    #[inline]
    pub fn batch_fn(&self) -> &B {
        &self.inner.batch_fn
    }

    pub fn stats(&self) -> LoaderStats {
        self.inner.stats.snapshot()
    }

    /// Number of cached keys, including those still in flight.
    pub fn cache_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    /// Request the value of `key`.
    ///
    /// Returns the cached slot of the key if there is one, whether it is resolved already or not. Otherwise the key is
    /// added to the current batch and a new pending slot is cached and returned. Never waits.
    ///
    /// Opening a new batch hands its dispatch to the scheduler. [`Tick`] and
    /// [`Delay`](crate::scheduler::Delay) spawn it, so with them this must be called within a Tokio runtime.
    pub fn load(&self, key: B::Key) -> SlotOf<B> {
        let inner = &self.inner;

        let (slot, opened) = {
            let mut state = inner.state.lock();

            if let Some(slot) = state.cache.get(&key) {
                inner.stats.cache_hit();
                trace!(loader = %inner.name, ?key, "cache hit");
                return slot;
            }

            let slot = Slot::pending();
            state.cache.insert(key.clone(), slot.clone());
            trace!(loader = %inner.name, ?key, "new request");
            let opened = state.enqueue(key, slot.clone(), inner.config.batch_limit());
            (slot, opened)
        };

        inner.stats.key_requested();

        // The lock must be released by now: a scheduler is free to do anything with the dispatch.
        if let Some(batch_id) = opened {
            inner.scheduler.schedule(self.dispatch_for(batch_id));
        }

        slot
    }

    /// [`load()`](Self::load) every key, preserving order. The window is held open until all keys are added, so the
    /// keys go out in one batch, unless `max_batch_size` splits it.
    pub fn load_many<I>(&self, keys: I) -> LoadMany<B::Value, B::Error>
    where
        I: IntoIterator<Item = B::Key>,
    {
        let _hold = self.hold_window();
        LoadMany {
            slots: keys.into_iter().map(|key| self.load(key)).collect(),
        }
    }

    /// Keep the scheduling window open until the returned hold is dropped. No batch of this loader is sent in the
    /// meantime, whatever its scheduler says; dispatches which came due wait for the hold to be released.
    ///
    /// Useful for a burst of individual [`load()`](Self::load) calls on a multi-threaded runtime. Never await a slot
    /// of this loader while holding the window: it won't resolve until the hold is gone.
    ///
    /// ```ignore
    /// let slots = {
    ///     let _hold = loader.hold_window();
    ///     posts.iter().map(|p| loader.load(p.author_id)).collect::<Vec<_>>()
    /// };
    /// ```
    pub fn hold_window(&self) -> WindowHold<'_, B> {
        self.inner.holds.send_modify(|count| *count += 1);
        WindowHold { inner: &self.inner }
    }

    /// Remove `key` from the cache. A request for the key which is already in a batch stays there, its callers still
    /// get the outcome. Returns true if there was an entry.
    pub fn clear(&self, key: &B::Key) -> bool {
        let removed = self.inner.state.lock().cache.remove(key).is_some();
        trace!(loader = %self.inner.name, ?key, removed, "clear");
        removed
    }

    pub fn clear_all(&self) {
        self.inner.state.lock().cache.clear();
        trace!(loader = %self.inner.name, "cache cleared");
    }

    /// Cache `value` for `key` unless the key is cached already. Returns true if the value was stored.
    pub fn prime(&self, key: B::Key, value: B::Value) -> bool {
        self.prime_slot(key, Slot::resolved(value))
    }

    /// Cache `value` for `key`, replacing any existing entry. Those who already hold the replaced slot keep waiting
    /// for its own outcome.
    pub fn prime_overwrite(&self, key: B::Key, value: B::Value) {
        trace!(loader = %self.inner.name, ?key, "prime with overwrite");
        self.inner.state.lock().cache.insert(key, Slot::resolved(value));
    }

    /// Cache a per-key failure for `key` unless the key is cached already. Returns true if the error was stored.
    pub fn prime_error(&self, key: B::Key, error: B::Error) -> bool {
        self.prime_slot(key, Slot::rejected(LoadError::Key(Arc::new(error))))
    }

    fn prime_slot(&self, key: B::Key, slot: SlotOf<B>) -> bool {
        let mut state = self.inner.state.lock();
        if state.cache.get(&key).is_some() {
            trace!(loader = %self.inner.name, ?key, "not priming a cached key");
            return false;
        }
        trace!(loader = %self.inner.name, ?key, "prime");
        state.cache.insert(key, slot);
        true
    }

    fn dispatch_for(&self, batch_id: u64) -> Dispatch {
        let inner = Arc::clone(&self.inner);
        Dispatch::new(batch_id, Arc::clone(&self.inner.name), async move {
            inner.dispatch(batch_id).await
        })
    }
}

impl<B> Clone for Loader<B>
where
    B: BatchFn,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> Debug for Loader<B>
where
    B: BatchFn,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// An open hold on the scheduling window of a loader, see [`Loader::hold_window()`].
#[must_use = "the window is released as soon as the hold is dropped"]
pub struct WindowHold<'a, B>
where
    B: BatchFn,
{
    inner: &'a LoaderInner<B>,
}

impl<B> Drop for WindowHold<'_, B>
where
    B: BatchFn,
{
    fn drop(&mut self) {
        self.inner.holds.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl<B> Debug for WindowHold<'_, B>
where
    B: BatchFn,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHold").field("loader", &self.inner.name).finish()
    }
}

/// Builder of a [`Loader`], see [`Loader::builder()`].
pub struct LoaderBuilder<B>
where
    B: BatchFn,
{
    batch_fn:  B,
    config:    Option<LoaderConfig>,
    scheduler: Option<Box<dyn Scheduler>>,
    cache:     Option<CacheMaker<B>>,
    observer:  Option<Box<dyn Observer<B>>>,
}

impl<B> LoaderBuilder<B>
where
    B: BatchFn,
{
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to [`Tick`].
    pub fn scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Defaults to [`HashMapCache`].
    pub fn cache<C>(mut self, factory: C) -> Self
    where
        C: CacheFactory<B::Key, SlotOf<B>>,
    {
        self.cache = Some(Box::new(move |name: &str| -> CacheOf<B> { Box::new(factory.create(name)) }));
        self
    }

    pub fn observer(mut self, observer: impl Observer<B>) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn build(self) -> Loader<B> {
        let config = self.config.unwrap_or_else(LoaderConfig::new);
        let name: Arc<str> = Arc::from(config.name().as_str());

        let cache: CacheOf<B> = match self.cache {
            Some(make) => make(&name),
            None => Box::new(<HashMapCache as CacheFactory<B::Key, SlotOf<B>>>::create(
                &HashMapCache,
                &name,
            )),
        };

        debug!(loader = %name, max_batch_size = config.batch_limit(), "loader created");

        Loader {
            inner: Arc::new(LoaderInner {
                name,
                config,
                batch_fn: self.batch_fn,
                scheduler: self.scheduler.unwrap_or_else(|| Box::new(Tick)),
                observer: self.observer,
                state: Mutex::new(LoaderState::new(cache)),
                holds: watch::Sender::new(0),
                stats: StatCounters::default(),
            }),
        }
    }
}

/// Slots of a [`Loader::load_many()`] call, in key order.
///
/// Awaiting it yields one result per key.
pub struct LoadMany<V, E> {
    slots: Vec<Slot<V, E>>,
}

impl<V, E> LoadMany<V, E>
where
    V: Clone,
{
    #[inline]
    pub fn slots(&self) -> &[Slot<V, E>] {
        &self.slots
    }

    #[inline]
    pub fn into_slots(self) -> Vec<Slot<V, E>> {
        self.slots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn wait(&self) -> Vec<LoadResult<V, E>> {
        let mut results = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            results.push(slot.wait().await);
        }
        results
    }

    /// All values or the first error in key order.
    pub async fn try_all(&self) -> LoadResult<Vec<V>, E> {
        let mut values = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            values.push(slot.wait().await?);
        }
        Ok(values)
    }
}

impl<V, E> IntoFuture for LoadMany<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;
    type Output = Vec<LoadResult<V, E>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<V, E> Debug for LoadMany<V, E>
where
    V: Debug,
    E: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::NoCache;
    use crate::scheduler::Manual;
    use crate::test::Behavior;
    use crate::test::RecordingBatch;
    use crate::test::RecordingObserver;

    fn manual_loader(max_batch_size: usize) -> (Loader<RecordingBatch>, Manual) {
        let manual = Manual::new();
        let loader = Loader::builder(RecordingBatch::new())
            .config(
                LoaderConfig::builder()
                    .name("manual")
                    .max_batch_size(max_batch_size)
                    .build()
                    .unwrap(),
            )
            .scheduler(manual.clone())
            .build();
        (loader, manual)
    }

    #[tokio::test]
    async fn sealed_batches_wait_for_their_dispatch() {
        let (loader, manual) = manual_loader(2);
        let many = loader.load_many([1, 2, 3, 4, 5]);

        {
            let state = loader.inner.state.lock();
            let sealed = state.sealed.iter().map(|b| b.keys.clone()).collect::<Vec<_>>();
            assert_eq!(sealed, vec![vec![1, 2], vec![3, 4]]);
            assert_eq!(state.open.as_ref().map(|b| b.keys.clone()), Some(vec![5]));
        }
        assert_eq!(manual.pending(), 3);
        assert_eq!(loader.batch_fn().call_count(), 0);

        assert_eq!(manual.flush().await, 3);
        assert_eq!(loader.batch_fn().calls(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert!(many.wait().await.iter().all(|r| r.is_ok()));

        let state = loader.inner.state.lock();
        assert!(state.open.is_none());
        assert!(state.sealed.is_empty());
    }

    #[tokio::test]
    async fn stale_dispatch_is_a_noop() {
        let (loader, _manual) = manual_loader(10);
        let slot = loader.load(1);
        loader.dispatch_for(0).run().await;
        loader.dispatch_for(0).run().await;
        assert_eq!(loader.batch_fn().call_count(), 1);
        assert_eq!(slot.await.unwrap(), RecordingBatch::value_for(1));
    }

    #[tokio::test]
    async fn dropped_dispatch_cancels_the_batch() {
        let observer = RecordingObserver::new();
        let slot = {
            let loader = Loader::builder(RecordingBatch::new())
                .scheduler(|_: Dispatch| {})
                .observer(observer.clone())
                .build();
            loader.load(1)
        };
        assert!(matches!(slot.await, Err(LoadError::Cancelled)));
        assert_eq!(observer.events(), vec!["cancel #0 [1]".to_string()]);
    }

    #[tokio::test]
    async fn held_window_defers_dispatch() {
        let (loader, manual) = manual_loader(10);
        let hold = loader.hold_window();
        let slot = loader.load(1);

        let flush = tokio::spawn({
            let manual = manual.clone();
            async move { manual.flush().await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(loader.batch_fn().call_count(), 0);

        loader.load(2);
        drop(hold);
        assert_eq!(flush.await.unwrap(), 1);
        assert_eq!(loader.batch_fn().calls(), vec![vec![1, 2]]);
        assert_eq!(slot.await.unwrap(), RecordingBatch::value_for(1));
    }

    #[tokio::test]
    async fn panicking_batch_fn_cancels_the_batch() {
        let loader = Loader::new(RecordingBatch::new());
        loader.batch_fn().set_behavior(Behavior::Panic);

        let results = loader.load_many([1, 2]).await;
        assert!(results.iter().all(|r| matches!(r, Err(LoadError::Cancelled))));
        assert_eq!(loader.cache_len(), 0);
        assert_eq!(loader.stats().failed_batches, 1);

        loader.batch_fn().set_behavior(Behavior::Normal);
        assert_eq!(loader.load(1).await.unwrap(), RecordingBatch::value_for(1));
    }

    #[tokio::test]
    async fn no_cache_keeps_duplicates() {
        let loader = Loader::builder(RecordingBatch::new()).cache(NoCache).build();
        let a = loader.load(1);
        let b = loader.load(1);
        assert!(!a.ptr_eq(&b));
        assert_eq!(a.await.unwrap(), b.await.unwrap());
        assert_eq!(loader.batch_fn().calls(), vec![vec![1, 1]]);
        assert_eq!(loader.cache_len(), 0);

        loader.load(1).await.unwrap();
        assert_eq!(loader.batch_fn().call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_batches_keep_slots_pending() {
        let loader = Loader::new(RecordingBatch::with_latency(Duration::from_millis(100)));
        let slot = loader.load(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slot.is_pending());
        assert!(loader.load(1).ptr_eq(&slot));
        assert_eq!(slot.await.unwrap(), RecordingBatch::value_for(1));
    }
}
