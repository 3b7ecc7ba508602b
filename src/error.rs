use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

/// The error a [`Slot`](crate::slot::Slot) rejects with.
///
/// Errors produced by the batch function are wrapped into an `Arc` because a single failure is shared by every caller
/// waiting on the same key, or by every key of a failed batch.
#[derive(Debug, Error)]
pub enum LoadError<E> {
    /// The batch function reported a failure for this particular key.
    #[error("{0}")]
    Key(Arc<E>),

    /// The batch function failed as a whole; every key of the batch gets the same error.
    #[error("batch load failed: {0}")]
    Batch(Arc<E>),

    /// The batch function returned a result vector which doesn't match the keys it was given.
    #[error("batch function returned {got} values for {expected} keys")]
    Contract { expected: usize, got: usize },

    /// The batch was dropped before this slot received a result.
    #[error("batch was dropped before a result was delivered")]
    Cancelled,
}

impl<E> LoadError<E> {
    /// The error reported by the batch function, if this is not a loader-level error.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Key(e) | Self::Batch(e) => Some(e),
            _ => None,
        }
    }

    #[inline]
    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::Key(_))
    }
}

// Not derived: derive(Clone) would require E: Clone while all we clone is the Arc.
impl<E> Clone for LoadError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Key(e) => Self::Key(Arc::clone(e)),
            Self::Batch(e) => Self::Batch(Arc::clone(e)),
            Self::Contract { expected, got } => Self::Contract {
                expected: *expected,
                got:      *got,
            },
            Self::Cancelled => Self::Cancelled,
        }
    }
}
