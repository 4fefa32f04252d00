//! Bounded pool of blocking validation workers.
//!
//! Machine stepping is CPU-bound and synchronous, so each job runs on Tokio's
//! blocking pool while a semaphore caps how many run at once. A panicking job
//! fails only its own run; the permit is released and the pool keeps serving.

use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Result, ValidatorError};
use crate::metrics::ValidatorMetrics;

#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    metrics: Arc<ValidatorMetrics>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize, metrics: Arc<ValidatorMetrics>) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
            metrics,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Idle workers.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` once a worker is free.
    ///
    /// Returns [`ValidatorError::Cancelled`] if `cancel` fires while queued.
    /// Once started, the job itself is responsible for observing cancellation.
    pub async fn run<T, F>(&self, cancel: &CancellationToken, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ValidatorError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => permit.map_err(|_| {
                ValidatorError::EngineUnavailable(format!("{} worker pool is closed", self.name))
            })?,
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                self.metrics.record_worker_panic();
                let message = panic_message(e.into_panic());
                error!(pool = self.name, "Validation worker panicked: {}", message);
                Err(ValidatorError::NativeEngineFault(format!(
                    "worker panicked: {message}"
                )))
            }
            Err(e) => Err(ValidatorError::NativeEngineFault(format!(
                "worker aborted: {e}"
            ))),
        }
    }

    /// Refuse new jobs. Jobs already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
