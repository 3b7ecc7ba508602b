//! Scheduling windows.
//!
//! When a loader opens a new batch it creates a [`Dispatch`] for it and hands it over to its [`Scheduler`]. Running
//! the dispatch seals the batch and sends it to the batch function, so the time between opening the batch and running
//! the dispatch is the window during which loads are collected into that batch.
//!
//! A plain closure taking a [`Dispatch`] is a scheduler too:
//!
//! ```ignore
//! let loader = Loader::builder(users)
//!     .scheduler(|dispatch: Dispatch| {
//!         tokio::spawn(async move {
//!             tokio::time::sleep(Duration::from_millis(2)).await;
//!             dispatch.run().await
//!         });
//!     })
//!     .build();
//! ```

use parking_lot::Mutex;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::runtime::RuntimeFlavor;
use tokio::task::JoinHandle;

/// A batch ready to be dispatched whenever its scheduler decides.
///
/// Running a dispatch of a batch which has already been sent is a no-op. Dropping a dispatch without running it
/// leaves the batch's slots pending for as long as the loader lives; they are rejected with
/// [`LoadError::Cancelled`](crate::error::LoadError::Cancelled) once the loader is gone.
pub struct Dispatch {
    batch_id: u64,
    loader:   Arc<str>,
    task:     Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Dispatch {
    pub(crate) fn new(batch_id: u64, loader: Arc<str>, task: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            batch_id,
            loader,
            task: Box::pin(task),
        }
    }

    #[inline]
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Name of the loader the batch belongs to.
    #[inline]
    pub fn loader_name(&self) -> &str {
        &self.loader
    }

    /// Seal the batch, send it to the batch function, and deliver the results.
    pub async fn run(self) {
        self.task.await
    }

    /// Run the dispatch on its own Tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("batch_id", &self.batch_id)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

pub trait Scheduler: Send + Sync + 'static {
    /// Arrange for `dispatch` to be run at the end of the scheduling window.
    fn schedule(&self, dispatch: Dispatch);
}

impl<F> Scheduler for F
where
    F: Fn(Dispatch) + Send + Sync + 'static,
{
    #[inline]
    fn schedule(&self, dispatch: Dispatch) {
        self(dispatch)
    }
}

/// The default scheduler: dispatch as soon as the loading task gives up control.
///
/// On a current-thread runtime the dispatch is spawned and yields once before running, so every load issued before the
/// loading task suspends ends up in the same batch. On a multi-threaded runtime an idle worker would pick the dispatch
/// up while the loading task is still going; there the dispatch waits for [`Tick::MULTI_THREAD_WINDOW`] instead. Bursts
/// of loads which must go out together regardless of timing are better wrapped with
/// [`Loader::hold_window()`](crate::Loader::hold_window); [`Loader::load_many()`](crate::Loader::load_many) does it on
/// its own.
///
/// Must be used within a Tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tick;

impl Tick {
    /// How long a dispatch waits on a multi-threaded runtime.
    pub const MULTI_THREAD_WINDOW: Duration = Duration::from_millis(1);
}

impl Scheduler for Tick {
    fn schedule(&self, dispatch: Dispatch) {
        let flavor = Handle::current().runtime_flavor();
        tokio::spawn(async move {
            if flavor == RuntimeFlavor::CurrentThread {
                tokio::task::yield_now().await;
            }
            else {
                tokio::time::sleep(Self::MULTI_THREAD_WINDOW).await;
            }
            dispatch.run().await
        });
    }
}

/// Collect loads for a fixed time after a batch was opened.
///
/// Trades latency for bigger batches: everything requested within `window`, across any number of suspension points,
/// goes out in one batch.
///
/// Must be used within a Tokio runtime.
#[derive(Debug, Clone, Copy)]
pub struct Delay {
    window: Duration,
}

impl Delay {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Scheduler for Delay {
    fn schedule(&self, dispatch: Dispatch) {
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            dispatch.run().await
        });
    }
}

/// Nothing is dispatched until [`Manual::flush()`] is called.
///
/// Clones share the queue. Keep one clone and give another one to the loader.
#[derive(Debug, Default, Clone)]
pub struct Manual {
    queue: Arc<Mutex<Vec<Dispatch>>>,
}

impl Manual {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches waiting for a flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run all queued dispatches one after another, in the order the batches were opened. Batches opened while flushing
    /// are dispatched too. Returns the number of dispatches run.
    pub async fn flush(&self) -> usize {
        let mut count = 0;
        loop {
            let queued = std::mem::take(&mut *self.queue.lock());
            if queued.is_empty() {
                break;
            }
            for dispatch in queued {
                dispatch.run().await;
                count += 1;
            }
        }
        count
    }
}

impl Scheduler for Manual {
    fn schedule(&self, dispatch: Dispatch) {
        self.queue.lock().push(dispatch);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn counting_dispatch(id: u64, counter: &Arc<AtomicUsize>) -> Dispatch {
        let counter = Arc::clone(counter);
        Dispatch::new(id, Arc::from("test"), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn manual_runs_on_flush_only() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manual = Manual::new();
        let scheduler: Box<dyn Scheduler> = Box::new(manual.clone());

        scheduler.schedule(counting_dispatch(1, &counter));
        scheduler.schedule(counting_dispatch(2, &counter));
        tokio::task::yield_now().await;

        assert_eq!(manual.pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(manual.flush().await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(manual.pending(), 0);
        assert_eq!(manual.flush().await, 0);
    }

    #[tokio::test]
    async fn tick_runs_after_yield() {
        let counter = Arc::new(AtomicUsize::new(0));
        Tick.schedule(counting_dispatch(1, &counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tick_runs_on_multi_thread_runtimes() {
        let counter = Arc::new(AtomicUsize::new(0));
        Tick.schedule(counting_dispatch(1, &counter));
        tokio::time::sleep(Tick::MULTI_THREAD_WINDOW * 20).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_for_the_window() {
        let counter = Arc::new(AtomicUsize::new(0));
        let delay = Delay::new(Duration::from_millis(50));
        assert_eq!(delay.window(), Duration::from_millis(50));
        delay.schedule(counting_dispatch(1, &counter));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closures_are_schedulers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_scheduler = Arc::clone(&seen);
        let scheduler = move |dispatch: Dispatch| {
            seen_by_scheduler
                .lock()
                .push((dispatch.batch_id(), dispatch.loader_name().to_string()));
            dispatch.spawn();
        };

        scheduler.schedule(counting_dispatch(7, &counter));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(*seen.lock(), vec![(7, "test".to_string())]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
