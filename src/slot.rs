use std::fmt::Debug;
use std::future::Future;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::LoadError;
use crate::types::LoadResult;

/// State of a [`Slot`]. Once it leaves `Pending` it never changes again.
#[derive(Debug)]
pub enum SlotState<V, E> {
    Pending,
    Resolved(V),
    Rejected(LoadError<E>),
}

impl<V, E> SlotState<V, E> {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// `None` while pending.
    pub fn into_result(self) -> Option<LoadResult<V, E>> {
        match self {
            Self::Pending => None,
            Self::Resolved(v) => Some(Ok(v)),
            Self::Rejected(e) => Some(Err(e)),
        }
    }
}

impl<V, E> Clone for SlotState<V, E>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Resolved(v) => Self::Resolved(v.clone()),
            Self::Rejected(e) => Self::Rejected(e.clone()),
        }
    }
}

/// Single-assignment placeholder for the outcome of one key.
///
/// Every caller asking for the same key while it is cached gets a clone of the same slot, hence the same outcome. A
/// slot can be awaited directly, or by reference with [`Slot::wait()`], as many times as needed.
///
/// ```ignore
/// let user = loader.load(user_id).await?;
/// ```
pub struct Slot<V, E> {
    cell: Arc<watch::Sender<SlotState<V, E>>>,
}

impl<V, E> Slot<V, E>
where
    V: Clone,
{
    fn with_state(state: SlotState<V, E>) -> Self {
        let (tx, _) = watch::channel(state);
        Self { cell: Arc::new(tx) }
    }

    pub(crate) fn pending() -> Self {
        Self::with_state(SlotState::Pending)
    }

    pub(crate) fn resolved(value: V) -> Self {
        Self::with_state(SlotState::Resolved(value))
    }

    pub(crate) fn rejected(error: LoadError<E>) -> Self {
        Self::with_state(SlotState::Rejected(error))
    }

    // Returns false if the slot was already completed, in which case the new state is discarded.
    pub(crate) fn complete(&self, state: SlotState<V, E>) -> bool {
        self.cell.send_if_modified(move |current| {
            if current.is_pending() {
                *current = state;
                true
            }
            else {
                false
            }
        })
    }

    #[inline]
    pub(crate) fn resolve(&self, value: V) -> bool {
        self.complete(SlotState::Resolved(value))
    }

    #[inline]
    pub(crate) fn reject(&self, error: LoadError<E>) -> bool {
        self.complete(SlotState::Rejected(error))
    }

    pub fn is_pending(&self) -> bool {
        self.cell.borrow().is_pending()
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> SlotState<V, E> {
        self.cell.borrow().clone()
    }

    /// The outcome, if there is one already. Never waits.
    pub fn try_result(&self) -> Option<LoadResult<V, E>> {
        self.state().into_result()
    }

    /// True if both slots share the same cell.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Wait for the slot to be resolved or rejected.
    pub async fn wait(&self) -> LoadResult<V, E> {
        let mut rx = self.cell.subscribe();
        let state = match rx.wait_for(|s| !s.is_pending()).await {
            Ok(state) => state.clone(),
            // The sender lives in our own cell, it can't be closed while we hold it.
            Err(_) => return Err(LoadError::Cancelled),
        };
        state.into_result().unwrap_or(Err(LoadError::Cancelled))
    }
}

impl<V, E> Clone for Slot<V, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<V, E> Debug for Slot<V, E>
where
    V: Debug,
    E: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Slot").field(&*self.cell.borrow()).finish()
    }
}

impl<V, E> IntoFuture for Slot<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;
    type Output = LoadResult<V, E>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type TestSlot = Slot<u32, String>;

    #[tokio::test]
    async fn resolves_only_once() {
        let slot = TestSlot::pending();
        assert!(slot.is_pending());
        assert!(slot.resolve(1));
        assert!(!slot.resolve(2));
        assert!(!slot.reject(LoadError::Cancelled));
        assert_eq!(slot.wait().await.unwrap(), 1);
        assert_eq!(slot.clone().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn all_clones_see_the_outcome() {
        let slot = TestSlot::pending();
        let waiters = (0..4)
            .map(|_| tokio::spawn(slot.clone().into_future()))
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(1)).await;
        slot.reject(LoadError::Key(Arc::new("no such record".to_string())));

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(err.is_key_error());
            assert_eq!(err.source_error().map(String::as_str), Some("no such record"));
        }
    }

    #[test]
    fn try_result_never_waits() {
        let slot = TestSlot::pending();
        assert!(slot.try_result().is_none());
        let primed = TestSlot::resolved(7);
        assert_eq!(primed.try_result().unwrap().unwrap(), 7);
        assert!(!primed.ptr_eq(&slot));
        assert!(primed.ptr_eq(&primed.clone()));
    }
}
