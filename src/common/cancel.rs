//! Composable cancellation signal for queries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply clonable cancellation signal.
///
/// Clones share the same flag. A [child](Cancellation::child) token is
/// cancelled when either it or any of its ancestors is cancelled, so a
/// query can combine a caller's token with its own internal deadline.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<Cancellation>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    /// Derive a token that is cancelled with this one, but can also be
    /// cancelled on its own without affecting this one.
    pub fn child(&self) -> Cancellation {
        Cancellation(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.0.cancelled.load(Ordering::Acquire) {
            return true;
        }

        self.0
            .parent
            .as_ref()
            .map(|parent| parent.is_cancelled())
            .unwrap_or(false)
    }
}
