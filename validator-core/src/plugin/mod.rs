//! Plugin System - Dynamic Loading of Execution Engines
//!
//! Loads an engine shared library at runtime with libloading and adapts its
//! C ABI (see [`crate::ffi`]) to [`MachineBackend`]/[`NativeMachine`].
//!
//! # Safety Model:
//! - Every entry point is resolved once at load time; a missing export fails
//!   the load rather than the first call that needs it.
//! - Each [`DynamicMachine`] holds an `Arc` of the library, so the library
//!   outlives every machine it created.
//! - A machine pointer is only ever used by one thread at a time
//!   ([`crate::machine::MachineHandle`] serializes access).

use anyhow::{Context, Result as AnyResult};
use libloading::{Library, Symbol};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{MachineBackend, NativeMachine};
use crate::error::{Result, ValidatorError};
use crate::ffi::{self, RawMachine, FFI_SUCCESS};
use crate::types::{Bytes32, GlobalState, InboxKind, MachineStatus};

/// Entry points of one loaded engine library.
struct EngineLibrary {
    path: PathBuf,
    load_machine: ffi::LoadMachineFn,
    clone_machine: ffi::CloneMachineFn,
    free_machine: ffi::FreeMachineFn,
    step: ffi::StepFn,
    step_until_host_io: ffi::StepUntilHostIoFn,
    free_string: ffi::FreeStringFn,
    hash: ffi::HashFn,
    module_root: ffi::HashFn,
    global_state: ffi::GetGlobalStateFn,
    set_global_state: ffi::SetGlobalStateFn,
    num_steps: ffi::GetNumStepsFn,
    status: ffi::GetStatusFn,
    gen_proof: ffi::GenProofFn,
    free_proof: ffi::FreeProofFn,
    serialize_state: ffi::SerializeStateFn,
    deserialize_state: ffi::DeserializeStateFn,
    add_inbox_message: ffi::AddInboxMessageFn,
    set_preimage_resolver: ffi::SetPreimageResolverFn,
    set_context: ffi::SetContextFn,
    supports_jit: Option<ffi::SupportsJitFn>,
    // Keeps every function pointer above valid.
    _library: Library,
}

/// Copy a function pointer out of the library.
///
/// # Safety
/// `T` must match the exported symbol's real signature.
unsafe fn export<T: Copy>(library: &Library, name: &str) -> AnyResult<T> {
    let symbol: Symbol<T> = library
        .get(name.as_bytes())
        .with_context(|| format!("Engine library missing '{}' export", name))?;
    Ok(*symbol)
}

/// Like [`export`], for entry points an engine may leave out.
///
/// # Safety
/// Same as [`export`].
unsafe fn optional_export<T: Copy>(library: &Library, name: &str) -> Option<T> {
    library.get::<T>(name.as_bytes()).ok().map(|symbol| *symbol)
}

/// JIT capability as reported by the engine. Engines without the export
/// are interpreter-only.
fn jit_capability(export: Option<ffi::SupportsJitFn>) -> bool {
    match export {
        Some(supports_jit) => unsafe { supports_jit() != 0 },
        None => false,
    }
}

impl EngineLibrary {
    fn open(path: &Path) -> AnyResult<Self> {
        let library = unsafe {
            Library::new(path).with_context(|| format!("Failed to load engine library from {:?}", path))?
        };
        unsafe {
            Ok(Self {
                path: path.to_path_buf(),
                load_machine: export(&library, "engine_load_machine")?,
                clone_machine: export(&library, "engine_clone_machine")?,
                free_machine: export(&library, "engine_free_machine")?,
                step: export(&library, "engine_step")?,
                step_until_host_io: export(&library, "engine_step_until_host_io")?,
                free_string: export(&library, "engine_free_string")?,
                hash: export(&library, "engine_hash")?,
                module_root: export(&library, "engine_module_root")?,
                global_state: export(&library, "engine_global_state")?,
                set_global_state: export(&library, "engine_set_global_state")?,
                num_steps: export(&library, "engine_get_num_steps")?,
                status: export(&library, "engine_get_status")?,
                gen_proof: export(&library, "engine_gen_proof")?,
                free_proof: export(&library, "engine_free_proof")?,
                serialize_state: export(&library, "engine_serialize_state")?,
                deserialize_state: export(&library, "engine_deserialize_and_replace_state")?,
                add_inbox_message: export(&library, "engine_add_inbox_message")?,
                set_preimage_resolver: export(&library, "engine_set_preimage_resolver")?,
                set_context: export(&library, "engine_set_context")?,
                supports_jit: optional_export(&library, "engine_supports_jit"),
                _library: library,
            })
        }
    }
}

/// [`MachineBackend`] backed by an engine shared library.
pub struct DynamicBackend {
    engine: Arc<EngineLibrary>,
}

impl DynamicBackend {
    /// Load an engine library and resolve all of its entry points.
    ///
    /// # Performance: Dynamic Linking Overhead
    /// One `dlopen` plus symbol resolution at startup; calls afterwards are
    /// plain indirect calls.
    pub fn load(path: &Path) -> AnyResult<Self> {
        info!("Loading engine library from {:?}", path);
        let engine = EngineLibrary::open(path)?;
        info!("Engine library {:?} loaded successfully", path);
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn path(&self) -> &Path {
        &self.engine.path
    }
}

impl MachineBackend for DynamicBackend {
    fn name(&self) -> &str {
        "dynamic"
    }

    fn load_machine(&self, image: &Path) -> Result<Box<dyn NativeMachine>> {
        let c_path = path_to_cstring(image)?;
        let raw = unsafe { (self.engine.load_machine)(c_path.as_ptr()) };
        let machine = DynamicMachine::adopt(Arc::clone(&self.engine), raw).ok_or_else(|| {
            ValidatorError::NativeEngineFault(format!("engine failed to load {}", image.display()))
        })?;
        unsafe {
            (self.engine.set_preimage_resolver)(machine.ptr.as_ptr(), ffi::resolve_preimage_for_engine);
        }
        debug!(image = %image.display(), "Loaded machine through engine library");
        Ok(Box::new(machine))
    }

    fn supports_jit(&self) -> bool {
        jit_capability(self.engine.supports_jit)
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    let raw = path
        .to_str()
        .ok_or_else(|| ValidatorError::InvalidInput(format!("non UTF-8 path {}", path.display())))?;
    CString::new(raw).map_err(|e| ValidatorError::InvalidInput(format!("invalid path {}: {e}", path.display())))
}

/// One machine living inside the engine library.
pub struct DynamicMachine {
    ptr: NonNull<RawMachine>,
    engine: Arc<EngineLibrary>,
}

// The engine machine has no thread affinity; exclusive access is enforced
// by `MachineHandle`.
unsafe impl Send for DynamicMachine {}

impl DynamicMachine {
    fn adopt(engine: Arc<EngineLibrary>, raw: *mut RawMachine) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self { ptr, engine })
    }

    /// Turn an engine error string into a result, preferring a preimage
    /// failure recorded during the call.
    fn check(&self, error: *mut std::os::raw::c_char) -> Result<()> {
        let message = if error.is_null() {
            None
        } else {
            let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
            unsafe { (self.engine.free_string)(error) };
            Some(message)
        };
        if let Some(failure) = ffi::take_resolution_failure() {
            return Err(failure);
        }
        match message {
            Some(message) => Err(ValidatorError::NativeEngineFault(message)),
            None => Ok(()),
        }
    }

    fn check_code(&self, code: ffi::FfiResult, what: &str, path: &Path) -> Result<()> {
        if code == FFI_SUCCESS {
            Ok(())
        } else {
            Err(ValidatorError::NativeEngineFault(format!(
                "engine failed to {what} {} (code {code})",
                path.display()
            )))
        }
    }
}

impl NativeMachine for DynamicMachine {
    fn clone_machine(&self) -> Result<Box<dyn NativeMachine>> {
        let raw = unsafe { (self.engine.clone_machine)(self.ptr.as_ptr()) };
        let clone = Self::adopt(Arc::clone(&self.engine), raw)
            .ok_or_else(|| ValidatorError::NativeEngineFault("engine failed to clone machine".to_string()))?;
        Ok(Box::new(clone))
    }

    fn step(&mut self, count: u64, interrupt: &AtomicU8) -> Result<()> {
        ffi::clear_resolution_failure();
        let error = unsafe { (self.engine.step)(self.ptr.as_ptr(), count, interrupt) };
        self.check(error)
    }

    fn step_until_host_io(&mut self, interrupt: &AtomicU8) -> Result<()> {
        ffi::clear_resolution_failure();
        let error = unsafe { (self.engine.step_until_host_io)(self.ptr.as_ptr(), interrupt) };
        self.check(error)
    }

    fn hash(&self) -> Bytes32 {
        unsafe { (self.engine.hash)(self.ptr.as_ptr()) }.into()
    }

    fn module_root(&self) -> Bytes32 {
        unsafe { (self.engine.module_root)(self.ptr.as_ptr()) }.into()
    }

    fn global_state(&self) -> GlobalState {
        unsafe { (self.engine.global_state)(self.ptr.as_ptr()) }.into()
    }

    fn set_global_state(&mut self, state: GlobalState) {
        unsafe { (self.engine.set_global_state)(self.ptr.as_ptr(), state.into()) }
    }

    fn step_count(&self) -> u64 {
        unsafe { (self.engine.num_steps)(self.ptr.as_ptr()) }
    }

    fn status(&self) -> MachineStatus {
        let raw = unsafe { (self.engine.status)(self.ptr.as_ptr()) };
        MachineStatus::from_u8(raw).unwrap_or_else(|| {
            warn!(raw, "Engine reported unknown machine status");
            MachineStatus::Errored
        })
    }

    fn prove_next_step(&self) -> Vec<u8> {
        unsafe {
            let proof = (self.engine.gen_proof)(self.ptr.as_ptr());
            let bytes = proof.to_vec();
            (self.engine.free_proof)(proof);
            bytes
        }
    }

    fn serialize_state(&self, path: &Path) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        let code = unsafe { (self.engine.serialize_state)(self.ptr.as_ptr(), c_path.as_ptr()) };
        self.check_code(code, "serialize state to", path)
    }

    fn deserialize_and_replace_state(&mut self, path: &Path) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        let code = unsafe { (self.engine.deserialize_state)(self.ptr.as_ptr(), c_path.as_ptr()) };
        self.check_code(code, "restore state from", path)
    }

    fn add_inbox_message(&mut self, kind: InboxKind, index: u64, data: &[u8]) -> Result<()> {
        let code = unsafe {
            (self.engine.add_inbox_message)(
                self.ptr.as_ptr(),
                kind.as_u64(),
                index,
                data.as_ptr(),
                data.len(),
            )
        };
        if code != FFI_SUCCESS {
            return Err(ValidatorError::NativeEngineFault(format!(
                "engine rejected inbox message {index} (code {code})"
            )));
        }
        Ok(())
    }

    fn set_resolver_context(&mut self, token: u64) {
        unsafe { (self.engine.set_context)(self.ptr.as_ptr(), token) }
    }
}

impl Drop for DynamicMachine {
    fn drop(&mut self) {
        unsafe { (self.engine.free_machine)(self.ptr.as_ptr()) }
    }
}
