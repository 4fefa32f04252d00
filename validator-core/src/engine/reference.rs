//! Reference engine - a small deterministic hash-chain machine
//!
//! Used for local runs and the test suite. An image is a JSON program; the
//! machine folds every executed instruction into a SHA-256 accumulator, reads
//! inbox messages into the global state, and pulls preimages through the
//! process-wide resolver registry exactly like an external engine would.
//!
//! Host-I/O instructions (`read-inbox`, `read-preimage`) are the boundaries
//! `step_until_host_io` stops at.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{MachineBackend, NativeMachine};
use crate::config::MachineFileConfig;
use crate::error::{Result, ValidatorError};
use crate::preimage::PreimageResolverRegistry;
use crate::types::{Bytes32, GlobalState, InboxKind, MachineStatus, ModuleRoot};

/// One reference-machine instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
    /// Fold a constant into the accumulator.
    Mix { value: u64 },
    /// Consume the next message of the given inbox.
    ReadInbox { kind: InboxKind },
    /// Fold the preimage of `hash` into the accumulator and the send root.
    ReadPreimage { hash: Bytes32 },
    Jump { target: usize },
    Halt,
    /// Enter the errored state.
    Fail,
}

impl Instruction {
    fn is_host_io(&self) -> bool {
        matches!(self, Self::ReadInbox { .. } | Self::ReadPreimage { .. })
    }
}

/// A compiled reference image. Its module root is the digest of its program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub program: Vec<Instruction>,
}

impl ReferenceImage {
    pub fn new(program: Vec<Instruction>) -> Self {
        Self { program }
    }

    pub fn module_root(&self) -> ModuleRoot {
        let encoded = serde_json::to_vec(&self.program).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"reference image:");
        hasher.update(&encoded);
        Bytes32(hasher.finalize().into())
    }

    /// Write this image under `<root_path>/<module root>/` using the
    /// configured file name, together with a `module-root.txt` marker.
    pub fn install(&self, root_path: &Path, files: &MachineFileConfig) -> std::io::Result<ModuleRoot> {
        let module_root = self.module_root();
        let dir = root_path.join(module_root.to_string());
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("module-root.txt"), format!("{module_root}\n"))?;
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(dir.join(&files.wavm_binary_path), encoded)?;
        Ok(module_root)
    }

    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| ValidatorError::NativeEngineFault(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&raw).map_err(|e| {
            ValidatorError::NativeEngineFault(format!("malformed image {}: {e}", path.display()))
        })
    }
}

/// Backend producing [`ReferenceMachine`]s.
#[derive(Debug, Clone)]
pub struct ReferenceBackend {
    jit: bool,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self { jit: true }
    }

    /// A backend that reports no JIT support, forcing interpreter fallback.
    pub fn without_jit() -> Self {
        Self { jit: false }
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn load_machine(&self, image: &Path) -> Result<Box<dyn NativeMachine>> {
        let image_data = ReferenceImage::load(image)?;
        let module_root = image_data.module_root();
        debug!(%module_root, path = %image.display(), "Loaded reference image");
        Ok(Box::new(ReferenceMachine::new(image_data.program, module_root)))
    }

    fn supports_jit(&self) -> bool {
        self.jit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MachineState {
    pc: usize,
    steps: u64,
    status: MachineStatus,
    acc: Bytes32,
    global: GlobalState,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    module_root: Bytes32,
    state: MachineState,
}

pub struct ReferenceMachine {
    program: Arc<Vec<Instruction>>,
    module_root: ModuleRoot,
    state: MachineState,
    inbox: HashMap<(InboxKind, u64), Vec<u8>>,
    context: u64,
}

impl ReferenceMachine {
    fn new(program: Vec<Instruction>, module_root: ModuleRoot) -> Self {
        Self {
            program: Arc::new(program),
            module_root,
            state: MachineState {
                pc: 0,
                steps: 0,
                status: MachineStatus::Running,
                acc: Bytes32::ZERO,
                global: GlobalState::default(),
            },
            inbox: HashMap::new(),
            context: 0,
        }
    }

    fn current(&self) -> Option<&Instruction> {
        self.program.get(self.state.pc)
    }

    /// Execute one instruction. Preimage failures leave the state untouched.
    fn execute_one(&mut self) -> Result<()> {
        let Some(instruction) = self.current().cloned() else {
            self.state.status = MachineStatus::Finished;
            return Ok(());
        };
        match instruction {
            Instruction::Mix { value } => {
                self.state.acc = fold(&self.state.acc, &value.to_be_bytes());
                self.state.pc += 1;
            }
            Instruction::ReadInbox { kind } => {
                let index = match kind {
                    InboxKind::Sequencer => self.state.global.batch,
                    InboxKind::Delayed => self.state.global.pos_in_batch,
                };
                let Some(data) = self.inbox.get(&(kind, index)) else {
                    self.state.status = MachineStatus::TooFar;
                    return Ok(());
                };
                let mut hasher = Sha256::new();
                hasher.update(self.state.global.block_hash.0);
                hasher.update(self.state.acc.0);
                hasher.update(data);
                self.state.global.block_hash = Bytes32(hasher.finalize().into());
                match kind {
                    InboxKind::Sequencer => {
                        self.state.global.batch += 1;
                        self.state.global.pos_in_batch = 0;
                    }
                    InboxKind::Delayed => self.state.global.pos_in_batch += 1,
                }
                self.state.pc += 1;
            }
            Instruction::ReadPreimage { hash } => {
                let data = PreimageResolverRegistry::global().resolve(self.context, hash)?;
                self.state.acc = fold(&self.state.acc, &data);
                self.state.global.send_root = fold(&self.state.global.send_root, &data);
                self.state.pc += 1;
            }
            Instruction::Jump { target } => {
                if target >= self.program.len() {
                    self.state.status = MachineStatus::Errored;
                } else {
                    self.state.pc = target;
                }
            }
            Instruction::Halt => self.state.status = MachineStatus::Finished,
            Instruction::Fail => self.state.status = MachineStatus::Errored,
        }
        self.state.steps += 1;
        Ok(())
    }
}

fn fold(acc: &Bytes32, data: &[u8]) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(acc.0);
    hasher.update(data);
    Bytes32(hasher.finalize().into())
}

fn interrupted(interrupt: &AtomicU8) -> bool {
    interrupt.load(Ordering::Relaxed) != 0
}

impl NativeMachine for ReferenceMachine {
    fn clone_machine(&self) -> Result<Box<dyn NativeMachine>> {
        Ok(Box::new(Self {
            program: Arc::clone(&self.program),
            module_root: self.module_root,
            state: self.state.clone(),
            inbox: self.inbox.clone(),
            context: self.context,
        }))
    }

    fn step(&mut self, count: u64, interrupt: &AtomicU8) -> Result<()> {
        for _ in 0..count {
            if self.state.status.is_halted() || interrupted(interrupt) {
                break;
            }
            self.execute_one()?;
        }
        Ok(())
    }

    fn step_until_host_io(&mut self, interrupt: &AtomicU8) -> Result<()> {
        while !self.state.status.is_halted() && !interrupted(interrupt) {
            if self.current().map_or(false, Instruction::is_host_io) {
                break;
            }
            self.execute_one()?;
        }
        Ok(())
    }

    fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        match self.state.status {
            MachineStatus::Running => {
                hasher.update(b"Machine running:");
                hasher.update(self.module_root.0);
                hasher.update((self.state.pc as u64).to_be_bytes());
                hasher.update(self.state.steps.to_be_bytes());
                hasher.update(self.state.acc.0);
                hasher.update(self.state.global.hash().0);
            }
            MachineStatus::Finished => {
                hasher.update(b"Machine finished:");
                hasher.update(self.state.global.hash().0);
            }
            MachineStatus::Errored => hasher.update(b"Machine errored:"),
            MachineStatus::TooFar => hasher.update(b"Machine too far:"),
        }
        Bytes32(hasher.finalize().into())
    }

    fn module_root(&self) -> Bytes32 {
        self.module_root
    }

    fn global_state(&self) -> GlobalState {
        self.state.global
    }

    fn set_global_state(&mut self, state: GlobalState) {
        self.state.global = state;
    }

    fn step_count(&self) -> u64 {
        self.state.steps
    }

    fn status(&self) -> MachineStatus {
        self.state.status
    }

    fn prove_next_step(&self) -> Vec<u8> {
        let mut proof = Vec::with_capacity(128);
        proof.push(self.state.status.as_u8());
        proof.extend_from_slice(&self.hash().0);
        proof.extend_from_slice(&(self.state.pc as u64).to_be_bytes());
        proof.extend_from_slice(&self.state.acc.0);
        if let Some(instruction) = self.current() {
            proof.extend(serde_json::to_vec(instruction).unwrap_or_default());
        }
        proof
    }

    fn serialize_state(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            module_root: self.module_root,
            state: self.state.clone(),
        };
        let encoded = serde_json::to_vec(&snapshot)
            .map_err(|e| ValidatorError::NativeEngineFault(e.to_string()))?;
        std::fs::write(path, encoded).map_err(|e| {
            ValidatorError::NativeEngineFault(format!(
                "failed to serialize machine state to {}: {e}",
                path.display()
            ))
        })
    }

    fn deserialize_and_replace_state(&mut self, path: &Path) -> Result<()> {
        let fault = |e: &dyn std::fmt::Display| {
            ValidatorError::NativeEngineFault(format!(
                "failed to deserialize machine state from {}: {e}",
                path.display()
            ))
        };
        let raw = std::fs::read(path).map_err(|e| fault(&e))?;
        let snapshot: Snapshot = serde_json::from_slice(&raw).map_err(|e| fault(&e))?;
        if snapshot.module_root != self.module_root {
            return Err(fault(&format!(
                "snapshot is for module root {}",
                snapshot.module_root
            )));
        }
        self.state = snapshot.state;
        Ok(())
    }

    fn add_inbox_message(&mut self, kind: InboxKind, index: u64, data: &[u8]) -> Result<()> {
        self.inbox.insert((kind, index), data.to_vec());
        Ok(())
    }

    fn set_resolver_context(&mut self, token: u64) {
        self.context = token;
    }
}

/// Locate an installed image for `module_root` under `root_path`.
pub fn image_path(root_path: &Path, module_root: ModuleRoot, files: &MachineFileConfig) -> PathBuf {
    root_path
        .join(module_root.to_string())
        .join(&files.wavm_binary_path)
}
