//! Validation spawners
//!
//! A spawner accepts `(module root, input)` and returns a [`ValidationRun`]
//! immediately; the machine work happens on a bounded [`WorkerPool`].
//!
//! # Variants:
//! - **Interpreter**: starts from the until-host-I/O machine and steps in
//!   chunks, checking status between chunks. Also serves proving sessions
//!   ([`ExecutionRun`]).
//! - **JIT**: starts from the zero-step machine and runs it to completion in
//!   a single engine call. Needs a backend that reports JIT support.
//!
//! Both follow the same run lifecycle: acquire the machine set, clone the
//! starting machine, load the input, drive it, report the final global state
//! or the first error, and destroy the clone.

pub mod execution_run;
pub mod interpreter;
pub mod jit;
pub mod pool;
pub mod promise;
pub mod run;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ValidatorError};
use crate::loader::{MachineSet, MachineSetLoader};
use crate::machine::{Deadline, MachineHandle};
use crate::metrics::ValidatorMetrics;
use crate::preimage::PreimageResolver;
use crate::types::{Bytes32, GlobalState, MachineStatus, ModuleRoot, ValidationInput};

pub use execution_run::{ExecutionRun, StepInfo};
pub use interpreter::InterpreterSpawner;
pub use jit::JitSpawner;
pub use pool::WorkerPool;
pub use promise::Promise;
pub use run::ValidationRun;

/// Common contract of the interpreter and JIT spawners.
#[async_trait]
pub trait ValidationSpawner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the spawner can serve runs. Called once before the first run.
    async fn start(&self) -> Result<()>;

    /// Launch a validation. The result arrives through the returned run.
    ///
    /// Must be called from within a Tokio runtime.
    fn execute_run(&self, module_root: ModuleRoot, input: ValidationInput) -> ValidationRun;

    /// Free worker slots.
    fn room(&self) -> usize;

    /// Cancel in-flight runs and refuse new ones.
    fn stop(&self);
}

/// Spawn the task that drives one run and resolves its promise.
pub(crate) fn launch<F, Fut>(
    spawner: &'static str,
    module_root: ModuleRoot,
    input_id: u64,
    shutdown: &CancellationToken,
    metrics: Arc<ValidatorMetrics>,
    work: F,
) -> ValidationRun
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<GlobalState>> + Send + 'static,
{
    let run = ValidationRun::new(input_id, module_root, shutdown.child_token());
    metrics.record_run_launched();
    debug!(spawner, run_id = input_id, %module_root, "Launching validation run");

    let future = work(run.cancel_token().clone());
    let handle = run.clone();
    let started = Instant::now();
    tokio::spawn(async move {
        let outcome = future.await;
        let elapsed = started.elapsed();
        metrics.record_run_outcome(elapsed, &outcome);
        match &outcome {
            Ok(state) => info!(
                spawner,
                run_id = input_id,
                %module_root,
                batch = state.batch,
                pos_in_batch = state.pos_in_batch,
                elapsed_ms = elapsed.as_millis() as u64,
                "Validation run finished"
            ),
            Err(e) if e.is_cancelled() => {
                debug!(spawner, run_id = input_id, %module_root, "Validation run cancelled")
            }
            Err(e) => warn!(spawner, run_id = input_id, %module_root, "Validation run failed: {}", e),
        }
        handle.consume_result(outcome);
    });
    run
}

/// Wait for the run's machine set.
///
/// The run timeout starts here, so a build that never finishes still fails
/// the run in time. The returned deadline carries the rest of that budget.
pub(crate) async fn acquire_machine_set(
    loader: &MachineSetLoader,
    module_root: ModuleRoot,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(Arc<MachineSet>, Deadline)> {
    let deadline = Deadline::with_timeout(cancel.clone(), timeout);
    let expired = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ValidatorError::Cancelled),
        _ = expired => {
            debug!(%module_root, "Run timed out waiting for machines");
            Err(ValidatorError::Cancelled)
        }
        set = loader.get_machine(module_root) => Ok((set?, deadline)),
    }
}

/// Load `input` into a fresh clone: start state, inbox, and preimages.
pub(crate) fn prepare_machine(machine: &MachineHandle, input: ValidationInput) -> Result<()> {
    let ValidationInput {
        start_state,
        sequencer_messages,
        delayed_messages,
        preimages,
        ..
    } = input;

    machine.set_global_state(start_state)?;
    for message in &sequencer_messages {
        machine.add_sequencer_inbox_message(message.index, &message.data)?;
    }
    for message in &delayed_messages {
        machine.add_delayed_inbox_message(message.index, &message.data)?;
    }
    let preimages = Arc::new(preimages);
    let resolver: PreimageResolver = Arc::new(move |hash: Bytes32| {
        preimages
            .get(&hash)
            .cloned()
            .ok_or_else(|| "preimage not supplied with input".to_string())
    });
    machine.set_preimage_resolver(resolver)?;
    Ok(())
}

/// Map a halted machine to the run outcome.
pub(crate) fn final_global_state(machine: &MachineHandle) -> Result<GlobalState> {
    match machine.status()? {
        MachineStatus::Finished => machine.global_state(),
        MachineStatus::Errored => Err(ValidatorError::NativeEngineFault(
            "machine entered errored state".to_string(),
        )),
        MachineStatus::TooFar => Err(ValidatorError::NativeEngineFault(
            "machine reached inbox position beyond supplied input".to_string(),
        )),
        MachineStatus::Running => Err(ValidatorError::NativeEngineFault(
            "machine stopped while still running".to_string(),
        )),
    }
}
