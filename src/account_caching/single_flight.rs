//! Deduplication of concurrent identical operations.
//!
//! The first caller of [`SingleFlight::run`] starts the operation on its own
//! task and stores a shared handle to its outcome; callers arriving while it
//! is pending await that same handle instead of starting another. Once the
//! outcome is known the slot is cleared, so a later call starts fresh.
//!
//! The operation runs on a spawned task, so dropping every waiting caller
//! does not cancel it.

use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

type Pending<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    pending: Mutex<Option<Pending<T>>>,
    fallback: T,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// `fallback` is returned if the spawned operation panics.
    pub fn new(fallback: T) -> Self {
        Self {
            pending: Mutex::new(None),
            fallback,
        }
    }

    pub async fn is_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let fallback = self.fallback.clone();
                    let handle = tokio::spawn(start());
                    let shared = async move { handle.await.unwrap_or(fallback) }
                        .boxed()
                        .shared();
                    *pending = Some(shared.clone());
                    shared
                }
            }
        };

        let outcome = shared.clone().await;

        let mut pending = self.pending.lock().await;
        if pending
            .as_ref()
            .is_some_and(|current| current.peek().is_some())
        {
            *pending = None;
        }
        outcome
    }
}
