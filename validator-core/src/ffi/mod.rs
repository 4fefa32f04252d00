//! FFI Bridge - C ABI shared with dynamically loaded engines
//!
//! This module defines the C-compatible types exchanged with an engine
//! shared library (see [`crate::plugin`]) and the preimage callback the
//! engine invokes while stepping.
//!
//! # Ownership rules:
//! - Machines, error strings and proofs are allocated by the engine and
//!   handed back to it for release (`engine_free_*`).
//! - Preimage buffers returned by [`resolve_preimage_for_engine`] are
//!   allocated with `malloc` and released by the engine with `free`.
//! - The engine calls the preimage callback on the thread that called
//!   `engine_step`, so resolution failures are parked in a thread local
//!   and collected by the caller right after the step returns.

use std::cell::RefCell;
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU8;

use crate::error::ValidatorError;
use crate::preimage::PreimageResolverRegistry;
use crate::types::{Bytes32, GlobalState};

/// C-compatible result code
pub type FfiResult = c_int;

pub const FFI_SUCCESS: FfiResult = 0;
pub const FFI_ERROR: FfiResult = -1;

/// Opaque engine machine.
pub type RawMachine = c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBytes32 {
    pub bytes: [u8; 32],
}

impl From<Bytes32> for CBytes32 {
    fn from(value: Bytes32) -> Self {
        Self { bytes: value.0 }
    }
}

impl From<CBytes32> for Bytes32 {
    fn from(value: CBytes32) -> Self {
        Bytes32(value.bytes)
    }
}

/// [`GlobalState`] as the engine lays it out: hashes first, then counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CGlobalState {
    /// `[block_hash, send_root]`
    pub bytes32_vals: [CBytes32; 2],
    /// `[batch, pos_in_batch]`
    pub u64_vals: [u64; 2],
}

impl From<GlobalState> for CGlobalState {
    fn from(state: GlobalState) -> Self {
        Self {
            bytes32_vals: [state.block_hash.into(), state.send_root.into()],
            u64_vals: [state.batch, state.pos_in_batch],
        }
    }
}

impl From<CGlobalState> for GlobalState {
    fn from(state: CGlobalState) -> Self {
        Self {
            block_hash: state.bytes32_vals[0].into(),
            send_root: state.bytes32_vals[1].into(),
            batch: state.u64_vals[0],
            pos_in_batch: state.u64_vals[1],
        }
    }
}

/// Engine-owned byte buffer. Must go back through `engine_free_proof`.
#[repr(C)]
#[derive(Debug)]
pub struct RustBytes {
    pub ptr: *mut u8,
    pub len: usize,
    pub cap: usize,
}

impl RustBytes {
    /// Copy the contents out.
    ///
    /// # Safety
    /// `ptr` must be valid for `len` bytes, or null with `len == 0`.
    pub unsafe fn to_vec(&self) -> Vec<u8> {
        if self.ptr.is_null() || self.len == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(self.ptr, self.len).to_vec()
    }
}

/// Answer to one preimage request. `len == -1` signals failure.
#[repr(C)]
#[derive(Debug)]
pub struct ResolvedPreimage {
    pub ptr: *mut u8,
    pub len: isize,
}

impl ResolvedPreimage {
    fn failed() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: -1,
        }
    }
}

pub type PreimageResolverCallback =
    unsafe extern "C" fn(context: u64, hash: *const u8) -> ResolvedPreimage;

// Engine entry points, resolved by name from the shared library.
pub type LoadMachineFn = unsafe extern "C" fn(path: *const c_char) -> *mut RawMachine;
pub type CloneMachineFn = unsafe extern "C" fn(machine: *const RawMachine) -> *mut RawMachine;
pub type FreeMachineFn = unsafe extern "C" fn(machine: *mut RawMachine);
pub type StepFn =
    unsafe extern "C" fn(machine: *mut RawMachine, count: u64, condition: *const AtomicU8) -> *mut c_char;
pub type StepUntilHostIoFn =
    unsafe extern "C" fn(machine: *mut RawMachine, condition: *const AtomicU8) -> *mut c_char;
pub type FreeStringFn = unsafe extern "C" fn(s: *mut c_char);
pub type HashFn = unsafe extern "C" fn(machine: *const RawMachine) -> CBytes32;
pub type GetGlobalStateFn = unsafe extern "C" fn(machine: *const RawMachine) -> CGlobalState;
pub type SetGlobalStateFn = unsafe extern "C" fn(machine: *mut RawMachine, state: CGlobalState);
pub type GetNumStepsFn = unsafe extern "C" fn(machine: *const RawMachine) -> u64;
pub type GetStatusFn = unsafe extern "C" fn(machine: *const RawMachine) -> u8;
pub type GenProofFn = unsafe extern "C" fn(machine: *const RawMachine) -> RustBytes;
pub type FreeProofFn = unsafe extern "C" fn(proof: RustBytes);
pub type SerializeStateFn =
    unsafe extern "C" fn(machine: *const RawMachine, path: *const c_char) -> FfiResult;
pub type DeserializeStateFn =
    unsafe extern "C" fn(machine: *mut RawMachine, path: *const c_char) -> FfiResult;
pub type AddInboxMessageFn = unsafe extern "C" fn(
    machine: *mut RawMachine,
    kind: u64,
    index: u64,
    data: *const u8,
    len: usize,
) -> FfiResult;
pub type SetPreimageResolverFn =
    unsafe extern "C" fn(machine: *mut RawMachine, callback: PreimageResolverCallback);
pub type SetContextFn = unsafe extern "C" fn(machine: *mut RawMachine, context: u64);
/// Optional export. Non-zero when the engine can run whole machines natively.
pub type SupportsJitFn = unsafe extern "C" fn() -> u8;

thread_local! {
    static RESOLUTION_FAILURE: RefCell<Option<ValidatorError>> = const { RefCell::new(None) };
}

/// Drop any failure left over from an earlier engine call on this thread.
pub(crate) fn clear_resolution_failure() {
    RESOLUTION_FAILURE.with(|slot| slot.borrow_mut().take());
}

/// The first resolution failure recorded on this thread since the last
/// clear, if any.
pub(crate) fn take_resolution_failure() -> Option<ValidatorError> {
    RESOLUTION_FAILURE.with(|slot| slot.borrow_mut().take())
}

fn record_resolution_failure(err: ValidatorError) {
    RESOLUTION_FAILURE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    });
}

/// Preimage callback handed to every dynamically loaded machine.
///
/// Looks `context` up in the global resolver registry. Never unwinds into
/// the engine: a panicking resolver is reported as a failed lookup.
///
/// # Safety
/// `hash` must point to 32 readable bytes.
pub unsafe extern "C" fn resolve_preimage_for_engine(context: u64, hash: *const u8) -> ResolvedPreimage {
    if hash.is_null() {
        return ResolvedPreimage::failed();
    }
    let mut bytes = [0u8; 32];
    std::ptr::copy_nonoverlapping(hash, bytes.as_mut_ptr(), 32);
    let hash = Bytes32(bytes);

    let lookup = std::panic::catch_unwind(AssertUnwindSafe(|| {
        PreimageResolverRegistry::global().resolve(context, hash)
    }))
    .unwrap_or_else(|_| {
        Err(ValidatorError::PreimageResolutionFailed {
            token: context,
            hash,
            reason: "resolver panicked".to_string(),
        })
    });

    let data = match lookup {
        Ok(data) => data,
        Err(e) => {
            record_resolution_failure(e);
            return ResolvedPreimage::failed();
        }
    };

    let ptr = libc::malloc(data.len().max(1)) as *mut u8;
    if ptr.is_null() {
        record_resolution_failure(ValidatorError::PreimageResolutionFailed {
            token: context,
            hash,
            reason: "out of memory".to_string(),
        });
        return ResolvedPreimage::failed();
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    ResolvedPreimage {
        ptr,
        len: data.len() as isize,
    }
}
