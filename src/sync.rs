//! Single-shot shared result cells.
//!
//! The launch pipeline starts work (provisioning, isolator prepare,
//! isolation, the reaper) whose settlement the destruction pipeline must
//! also be able to observe, possibly much later and from a different task.
//! `Promise`/`Pending` wrap a `tokio::sync::watch` channel into a cell that
//! is set at most once and can be awaited by any number of readers.

use tokio::sync::watch;

/// Write side of a single-shot cell. Cloneable; the first `set` wins.
#[derive(Debug, Clone)]
pub struct Promise<T> {
    tx: std::sync::Arc<watch::Sender<Option<T>>>,
}

/// Read side of a single-shot cell.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Promise<T> {
    /// Creates an unset cell.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Creates a cell that is already settled.
    #[must_use]
    pub fn settled(value: T) -> Self {
        let promise = Self::new();
        promise.set(value);
        promise
    }

    /// Settles the cell. Returns `false` if it was already settled.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = value.take();
                true
            } else {
                false
            }
        })
    }

    /// A read handle onto this cell.
    #[must_use]
    pub fn pending(&self) -> Pending<T> {
        Pending {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Pending<T> {
    /// Waits until the cell settles.
    ///
    /// Returns `None` only if every `Promise` handle was dropped without
    /// settling, which callers treat as discarded work.
    pub async fn wait(mut self) -> Option<T> {
        loop {
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }

    /// The settled value, if any, without waiting.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}
