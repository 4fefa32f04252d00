//! Interpreter spawner: chunked stepping from the until-host-I/O machine.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::execution_run::ExecutionRun;
use super::pool::WorkerPool;
use super::run::ValidationRun;
use super::{acquire_machine_set, final_global_state, launch, prepare_machine, ValidationSpawner};
use crate::config::InterpreterSpawnerConfig;
use crate::error::{Result, ValidatorError};
use crate::loader::MachineSetLoader;
use crate::machine::{Deadline, MachineHandle};
use crate::metrics::ValidatorMetrics;
use crate::types::{GlobalState, ModuleRoot, ValidationInput};

const NAME: &str = "interpreter";

pub struct InterpreterSpawner {
    loader: Arc<MachineSetLoader>,
    config: InterpreterSpawnerConfig,
    pool: WorkerPool,
    metrics: Arc<ValidatorMetrics>,
    shutdown: CancellationToken,
}

impl InterpreterSpawner {
    pub fn new(
        loader: Arc<MachineSetLoader>,
        config: InterpreterSpawnerConfig,
        metrics: Arc<ValidatorMetrics>,
    ) -> Self {
        let pool = WorkerPool::new(NAME, config.worker_count(), Arc::clone(&metrics));
        Self {
            loader,
            config,
            pool,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a proving session over `input`, starting at step 0.
    pub async fn create_execution_run(
        &self,
        module_root: ModuleRoot,
        input: ValidationInput,
    ) -> Result<ExecutionRun> {
        let set = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ValidatorError::Cancelled),
            set = self.loader.get_machine(module_root) => set?,
        };
        let prepared = self
            .pool
            .run(&self.shutdown, move || {
                let machine = set.zero_step().clone_handle()?;
                prepare_machine(&machine, input)?;
                Ok(machine)
            })
            .await?;
        ExecutionRun::new(
            module_root,
            prepared,
            self.pool.clone(),
            self.shutdown.child_token(),
            self.config.step_chunk,
        )
    }
}

#[async_trait]
impl ValidationSpawner for InterpreterSpawner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self) -> Result<()> {
        info!(
            workers = self.pool.size(),
            step_chunk = self.config.step_chunk,
            "Interpreter spawner started"
        );
        Ok(())
    }

    fn execute_run(&self, module_root: ModuleRoot, input: ValidationInput) -> ValidationRun {
        let loader = Arc::clone(&self.loader);
        let pool = self.pool.clone();
        let timeout = self.config.run_timeout();
        let step_chunk = self.config.step_chunk.max(1);

        launch(
            NAME,
            module_root,
            input.id,
            &self.shutdown,
            Arc::clone(&self.metrics),
            move |cancel| async move {
                let (set, deadline) =
                    acquire_machine_set(&loader, module_root, &cancel, timeout).await?;
                pool.run(&cancel, move || {
                    let machine = set.host_io().clone_handle()?;
                    let outcome = interpret(&machine, input, &deadline, step_chunk);
                    // Never fails on a handle we have not destroyed yet.
                    let _ = machine.destroy();
                    outcome
                })
                .await
            },
        )
    }

    fn room(&self) -> usize {
        self.pool.available()
    }

    fn stop(&self) {
        self.shutdown.cancel();
        self.pool.close();
        info!("Interpreter spawner stopped");
    }
}

fn interpret(
    machine: &MachineHandle,
    input: ValidationInput,
    deadline: &Deadline,
    step_chunk: u64,
) -> Result<GlobalState> {
    prepare_machine(machine, input)?;
    machine.step_in_chunks(deadline, step_chunk)?;
    final_global_state(machine)
}
