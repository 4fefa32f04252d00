//! Machine handles - exclusive ownership of one engine instance
//!
//! A [`MachineHandle`] is the only way the rest of the validator touches a
//! live machine. It guarantees:
//!
//! - **Serialization**: every operation takes the handle's lock, so at most
//!   one thread is inside the engine for a given machine.
//! - **Deterministic release**: the engine instance is freed by
//!   [`MachineHandle::destroy`] or, failing that, when the handle drops.
//!   After destruction every operation returns
//!   [`ValidatorError::DestroyedHandle`].
//! - **Freezing**: a frozen handle rejects mutation but stays readable and
//!   cloneable. Clones are never frozen.
//! - **Resolver families**: clones share the source's preimage-resolver
//!   registration; the registry entry outlives every handle in the family.

pub mod cancel;

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::engine::NativeMachine;
use crate::error::{Result, ValidatorError};
use crate::preimage::{PreimageResolver, PreimageResolverRegistry, ResolverRegistration};
use crate::types::{Bytes32, GlobalState, InboxKind, MachineStatus};

pub use cancel::{Deadline, WATCHER_POLL_INTERVAL};

struct HandleState {
    /// `None` once destroyed.
    machine: Option<Box<dyn NativeMachine>>,
    frozen: bool,
    resolver: Option<Arc<ResolverRegistration>>,
}

pub struct MachineHandle {
    id: u64,
    state: Mutex<HandleState>,
}

fn next_handle_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl MachineHandle {
    /// Take ownership of a freshly loaded engine instance.
    pub fn new(machine: Box<dyn NativeMachine>) -> Self {
        Self::with_resolver(machine, None)
    }

    fn with_resolver(
        mut machine: Box<dyn NativeMachine>,
        resolver: Option<Arc<ResolverRegistration>>,
    ) -> Self {
        if let Some(registration) = &resolver {
            machine.set_resolver_context(registration.token());
        }
        let id = next_handle_id();
        trace!(handle = id, "Created machine handle");
        Self {
            id,
            state: Mutex::new(HandleState {
                machine: Some(machine),
                frozen: false,
                resolver,
            }),
        }
    }

    /// Process-unique handle identifier, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn read<R>(&self, f: impl FnOnce(&dyn NativeMachine) -> R) -> Result<R> {
        let state = self.state.lock();
        let machine = state.machine.as_deref().ok_or(ValidatorError::DestroyedHandle)?;
        Ok(f(machine))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut dyn NativeMachine) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let frozen = state.frozen;
        let machine = state
            .machine
            .as_deref_mut()
            .ok_or(ValidatorError::DestroyedHandle)?;
        if frozen {
            return Err(ValidatorError::FrozenHandle);
        }
        f(machine)
    }

    /// Independent copy with its own engine instance and lock.
    ///
    /// The copy is never frozen and joins the source's resolver family.
    pub fn clone_handle(&self) -> Result<MachineHandle> {
        let (machine, resolver) = {
            let state = self.state.lock();
            let machine = state.machine.as_deref().ok_or(ValidatorError::DestroyedHandle)?;
            (machine.clone_machine()?, state.resolver.clone())
        };
        let clone = Self::with_resolver(machine, resolver);
        debug!(source = self.id, clone = clone.id, "Cloned machine handle");
        Ok(clone)
    }

    /// Irreversibly reject further mutation through this handle.
    pub fn freeze(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.machine.is_none() {
            return Err(ValidatorError::DestroyedHandle);
        }
        state.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> Result<bool> {
        let state = self.state.lock();
        if state.machine.is_none() {
            return Err(ValidatorError::DestroyedHandle);
        }
        Ok(state.frozen)
    }

    /// Advance up to `count` steps.
    ///
    /// Returns [`ValidatorError::Cancelled`] if `deadline` fired during the
    /// call, even when some steps completed; the step count reflects them.
    pub fn step(&self, deadline: &Deadline, count: u64) -> Result<()> {
        self.mutate(|machine| {
            let (result, fired) = cancel::with_interrupt(deadline, |interrupt| {
                machine.step(count, interrupt)
            });
            result?;
            if fired {
                return Err(ValidatorError::Cancelled);
            }
            Ok(())
        })
    }

    /// Step `chunk` steps at a time until the machine halts.
    ///
    /// One watcher covers the whole call, however many chunks it takes.
    /// Cancellation is reported as for [`step`](Self::step).
    pub fn step_in_chunks(&self, deadline: &Deadline, chunk: u64) -> Result<()> {
        let chunk = chunk.max(1);
        self.mutate(|machine| {
            if deadline.is_expired() {
                return Err(ValidatorError::Cancelled);
            }
            let (result, fired): (Result<()>, bool) = cancel::with_interrupt(deadline, |interrupt| {
                while machine.status() == MachineStatus::Running
                    && interrupt.load(Ordering::Acquire) == 0
                {
                    machine.step(chunk, interrupt)?;
                }
                Ok(())
            });
            result?;
            if fired {
                return Err(ValidatorError::Cancelled);
            }
            Ok(())
        })
    }

    /// Run until the machine needs host input or halts.
    pub fn step_until_host_io(&self, deadline: &Deadline) -> Result<()> {
        self.mutate(|machine| {
            let (result, fired) = cancel::with_interrupt(deadline, |interrupt| {
                machine.step_until_host_io(interrupt)
            });
            result?;
            if fired {
                return Err(ValidatorError::Cancelled);
            }
            Ok(())
        })
    }

    pub fn hash(&self) -> Result<Bytes32> {
        self.read(|m| m.hash())
    }

    pub fn module_root(&self) -> Result<Bytes32> {
        self.read(|m| m.module_root())
    }

    pub fn global_state(&self) -> Result<GlobalState> {
        self.read(|m| m.global_state())
    }

    pub fn set_global_state(&self, global_state: GlobalState) -> Result<()> {
        self.mutate(|m| {
            m.set_global_state(global_state);
            Ok(())
        })
    }

    pub fn step_count(&self) -> Result<u64> {
        self.read(|m| m.step_count())
    }

    pub fn status(&self) -> Result<MachineStatus> {
        self.read(|m| m.status())
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.status()? == MachineStatus::Running)
    }

    pub fn is_errored(&self) -> Result<bool> {
        Ok(self.status()? == MachineStatus::Errored)
    }

    /// Whether this machine's state is the state at step `requested`.
    pub fn valid_for_step(&self, requested: u64) -> Result<bool> {
        self.read(|m| {
            let have = m.step_count();
            if have > requested {
                false
            } else if have == requested {
                true
            } else {
                m.status().is_halted()
            }
        })
    }

    pub fn prove_next_step(&self) -> Result<Vec<u8>> {
        self.read(|m| m.prove_next_step())
    }

    pub fn serialize_state(&self, path: &Path) -> Result<()> {
        let state = self.state.lock();
        let machine = state.machine.as_deref().ok_or(ValidatorError::DestroyedHandle)?;
        machine.serialize_state(path)
    }

    pub fn deserialize_and_replace_state(&self, path: &Path) -> Result<()> {
        self.mutate(|m| m.deserialize_and_replace_state(path))
    }

    pub fn add_sequencer_inbox_message(&self, index: u64, data: &[u8]) -> Result<()> {
        self.mutate(|m| m.add_inbox_message(InboxKind::Sequencer, index, data))
    }

    pub fn add_delayed_inbox_message(&self, index: u64, data: &[u8]) -> Result<()> {
        self.mutate(|m| m.add_inbox_message(InboxKind::Delayed, index, data))
    }

    /// Bind `resolver` through the process-wide registry.
    ///
    /// This handle leaves its previous resolver family (if any) and starts a
    /// new one that its future clones will join.
    pub fn set_preimage_resolver(&self, resolver: PreimageResolver) -> Result<u64> {
        let mut state = self.state.lock();
        let frozen = state.frozen;
        let machine = state
            .machine
            .as_deref_mut()
            .ok_or(ValidatorError::DestroyedHandle)?;
        if frozen {
            return Err(ValidatorError::FrozenHandle);
        }
        let registration = PreimageResolverRegistry::global().register_family(resolver);
        let token = registration.token();
        machine.set_resolver_context(token);
        state.resolver = Some(registration);
        debug!(handle = self.id, token, "Bound preimage resolver");
        Ok(token)
    }

    /// Registry token of this handle's resolver family.
    pub fn resolver_token(&self) -> Result<Option<u64>> {
        let state = self.state.lock();
        if state.machine.is_none() {
            return Err(ValidatorError::DestroyedHandle);
        }
        Ok(state.resolver.as_ref().map(|r| r.token()))
    }

    /// Release the engine instance.
    ///
    /// The first call succeeds; any later call returns
    /// [`ValidatorError::DestroyedHandle`].
    pub fn destroy(&self) -> Result<()> {
        let (machine, resolver) = {
            let mut state = self.state.lock();
            let machine = state.machine.take().ok_or(ValidatorError::DestroyedHandle)?;
            (machine, state.resolver.take())
        };
        drop(machine);
        drop(resolver);
        debug!(handle = self.id, "Destroyed machine handle");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().machine.is_none()
    }
}

impl std::fmt::Debug for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MachineHandle")
            .field("id", &self.id)
            .field("frozen", &state.frozen)
            .field("destroyed", &state.machine.is_none())
            .finish()
    }
}
