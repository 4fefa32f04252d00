//! Error types shared by every layer of the validator.
//!
//! Handle-level failures are returned synchronously from the failing call.
//! Run-level failures travel through a run's promise, so the error type is
//! `Clone`: one failed build fans out to every joined caller and every run
//! that was waiting on it.

use thiserror::Error;

use crate::types::Bytes32;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ValidatorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidatorError {
    /// A state-mutating operation was attempted on a frozen handle.
    #[error("machine frozen")]
    FrozenHandle,

    /// Any operation on a handle whose native machine was already released.
    #[error("machine destroyed")]
    DestroyedHandle,

    /// Failure reported by the execution engine itself, surfaced verbatim.
    #[error("execution engine fault: {0}")]
    NativeEngineFault(String),

    /// The loader could not construct a machine set. Never cached.
    #[error("failed to build machines for module root {module_root}: {reason}")]
    BuildFailed { module_root: Bytes32, reason: String },

    /// The engine asked for a preimage that could not be supplied.
    #[error("preimage resolution failed for {hash} (resolver token {token}): {reason}")]
    PreimageResolutionFailed {
        token: u64,
        hash: Bytes32,
        reason: String,
    },

    /// The caller's deadline or cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine backend is unusable for the whole spawner.
    #[error("execution engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid validation input: {0}")]
    InvalidInput(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl ValidatorError {
    /// `true` when the failure means "gave up" rather than "engine broke".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` for failures that a later identical request may not repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BuildFailed { .. } | Self::Cancelled | Self::PreimageResolutionFailed { .. }
        )
    }

    pub(crate) fn build_failed(module_root: Bytes32, reason: impl ToString) -> Self {
        Self::BuildFailed {
            module_root,
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for ValidatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
