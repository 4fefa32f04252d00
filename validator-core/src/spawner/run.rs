//! Handle for one launched validation.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::promise::Promise;
use crate::error::{Result, ValidatorError};
use crate::types::{GlobalState, ModuleRoot};

/// A launched validation: a promise for its final [`GlobalState`] plus the
/// module root it runs against.
///
/// Clones share the same promise and cancellation token.
#[derive(Clone)]
pub struct ValidationRun {
    id: u64,
    module_root: ModuleRoot,
    promise: Promise<GlobalState>,
    cancel: CancellationToken,
}

impl ValidationRun {
    pub(crate) fn new(id: u64, module_root: ModuleRoot, cancel: CancellationToken) -> Self {
        Self {
            id,
            module_root,
            promise: Promise::new(),
            cancel,
        }
    }

    /// Input id this run validates.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module_root(&self) -> ModuleRoot {
        self.module_root
    }

    pub fn promise(&self) -> &Promise<GlobalState> {
        &self.promise
    }

    /// Deliver the worker's outcome. Only the first outcome is kept.
    pub fn consume_result(&self, outcome: Result<GlobalState>) -> bool {
        match outcome {
            Ok(state) => self.promise.produce(state),
            Err(e) => self.promise.produce_error(e),
        }
    }

    /// Wait for the final state. A timeout yields [`ValidatorError::Cancelled`]
    /// but leaves the run going; call [`close`](Self::close) to stop it.
    pub async fn await_result(&self, timeout: Option<Duration>) -> Result<GlobalState> {
        self.promise.await_result(timeout).await
    }

    pub fn try_result(&self) -> Option<Result<GlobalState>> {
        self.promise.try_result()
    }

    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the run. An unresolved run resolves to
    /// [`ValidatorError::Cancelled`].
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(run = self.id, module_root = %self.module_root, "Closing validation run");
        }
        self.cancel.cancel();
        if !self.promise.is_resolved() {
            self.promise.produce_error(ValidatorError::Cancelled);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ValidationRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRun")
            .field("id", &self.id)
            .field("module_root", &self.module_root)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
