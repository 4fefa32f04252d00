//! Single-assignment promise.
//!
//! The first `produce`/`produce_error` wins. Later resolutions are ignored,
//! return `false`, and are logged; they never overwrite the delivered
//! outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{Result, ValidatorError};

pub struct Promise<T> {
    slot: Arc<watch::Sender<Option<Result<T>>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    fn resolve(&self, outcome: Result<T>) -> bool {
        let accepted = self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if !accepted {
            warn!("Ignoring second resolution of an already resolved promise");
        }
        accepted
    }

    /// Fulfil the promise. Returns `false` if it was already resolved.
    pub fn produce(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Fail the promise. Returns `false` if it was already resolved.
    pub fn produce_error(&self, err: ValidatorError) -> bool {
        self.resolve(Err(err))
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// The outcome, if already resolved.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.slot.borrow().clone()
    }

    /// Wait for the outcome. A timeout yields [`ValidatorError::Cancelled`].
    pub async fn await_result(&self, timeout: Option<Duration>) -> Result<T> {
        let mut receiver = self.slot.subscribe();
        let wait = async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(slot) => (*slot).clone(),
                Err(_) => None,
            }
        };
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ValidatorError::Cancelled)?,
            None => wait.await,
        };
        // The sender lives in `self`, so the slot cannot close unresolved.
        outcome.unwrap_or(Err(ValidatorError::Cancelled))
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
