//! Validator Core - Machine Lifecycle and Concurrent Validation Runs
//!
//! This crate sits between a rollup validator and its deterministic
//! execution engine. It loads compiled machine images by module root, keeps
//! frozen canonical snapshots of them, clones those snapshots per validation
//! run, and executes the runs on a bounded pool with cancellation.
//!
//! # Layers:
//! - [`engine`]: the seam to the execution engine (in-process reference
//!   engine, or a shared library through [`plugin`] and [`ffi`])
//! - [`machine`]: thread-safe handles with freeze, clone and destroy
//! - [`preimage`]: process-wide registry of preimage resolvers
//! - [`loader`]: single-flight cache of machine sets keyed by module root
//! - [`spawner`]: interpreter and JIT run execution, proving sessions
//! - [`service`]: the validation node that ties them together

pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod loader;
pub mod machine;
pub mod metrics;
pub mod plugin;
pub mod preimage;
pub mod service;
pub mod spawner;
pub mod types;

pub use config::{
    InterpreterSpawnerConfig, JitSpawnerConfig, MachineFileConfig, ValidationConfig, WasmConfig,
};
pub use engine::{MachineBackend, NativeMachine, ReferenceBackend, ReferenceImage};
pub use error::{Result, ValidatorError};
pub use loader::{LoaderStats, MachineLoader, MachineLocator, MachineSet, MachineSetLoader};
pub use machine::{Deadline, MachineHandle};
pub use metrics::{MetricsSnapshot, ValidatorMetrics};
pub use plugin::DynamicBackend;
pub use preimage::{PreimageResolver, PreimageResolverRegistry};
pub use service::ValidationNode;
pub use spawner::{
    ExecutionRun, InterpreterSpawner, JitSpawner, Promise, StepInfo, ValidationRun,
    ValidationSpawner,
};
pub use types::{Bytes32, GlobalState, InboxKind, MachineStatus, ModuleRoot, ValidationInput};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Meant for binaries. Calling it again is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        info!("Initializing validator core v{}", env!("CARGO_PKG_VERSION"));
    }
}
