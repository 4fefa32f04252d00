//! Engine seam - the boundary to the sandboxed execution machine
//!
//! The validator never interprets machine instructions itself. It drives an
//! opaque engine through two traits:
//!
//! - [`MachineBackend`] turns an on-disk image into a live machine.
//! - [`NativeMachine`] is one live machine instance.
//!
//! Implementations:
//! - [`reference::ReferenceBackend`]: an in-process deterministic machine.
//! - [`crate::plugin::DynamicBackend`]: an engine shared library loaded at
//!   runtime through a C ABI.
//!
//! Nothing here is synchronized. [`crate::machine::MachineHandle`] owns a
//! `Box<dyn NativeMachine>` and serializes every call to it.

pub mod reference;

use std::path::Path;
use std::sync::atomic::AtomicU8;

use crate::error::Result;
use crate::types::{Bytes32, GlobalState, InboxKind, MachineStatus};

pub use reference::{Instruction, ReferenceBackend, ReferenceImage};

/// One live instance of the execution engine.
///
/// `interrupt` arguments are condition bytes: the engine polls them while
/// stepping and returns early once they read non-zero.
pub trait NativeMachine: Send {
    /// Deep copy with no shared mutable state.
    fn clone_machine(&self) -> Result<Box<dyn NativeMachine>>;

    /// Advance up to `count` steps, stopping early on halt or interrupt.
    fn step(&mut self, count: u64, interrupt: &AtomicU8) -> Result<()>;

    /// Run until the next instruction needs host input, or the machine halts.
    fn step_until_host_io(&mut self, interrupt: &AtomicU8) -> Result<()>;

    fn hash(&self) -> Bytes32;

    fn module_root(&self) -> Bytes32;

    fn global_state(&self) -> GlobalState;

    fn set_global_state(&mut self, state: GlobalState);

    fn step_count(&self) -> u64;

    fn status(&self) -> MachineStatus;

    /// Opaque one-step proof for the transition out of the current state.
    fn prove_next_step(&self) -> Vec<u8>;

    fn serialize_state(&self, path: &Path) -> Result<()>;

    fn deserialize_and_replace_state(&mut self, path: &Path) -> Result<()>;

    fn add_inbox_message(&mut self, kind: InboxKind, index: u64, data: &[u8]) -> Result<()>;

    /// Bind the preimage-resolver registry token used for this machine's
    /// preimage requests. `0` unbinds.
    fn set_resolver_context(&mut self, token: u64);
}

/// Factory for machines of one engine implementation.
pub trait MachineBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Load the zero-step machine from a compiled image on disk.
    fn load_machine(&self, image: &Path) -> Result<Box<dyn NativeMachine>>;

    /// Whether the engine can execute whole runs natively (the JIT path).
    fn supports_jit(&self) -> bool {
        false
    }

    /// Check that the engine is usable at all. Failures here are fatal for
    /// every spawner that relies on this backend.
    fn probe(&self) -> Result<()> {
        Ok(())
    }
}
