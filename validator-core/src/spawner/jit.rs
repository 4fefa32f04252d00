//! JIT spawner: one uninterrupted engine call from the zero-step machine.
//!
//! An unusable backend is a spawner-wide condition, not a per-run error: it
//! is reported once on the fatal channel so the owner can fall back.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::pool::WorkerPool;
use super::run::ValidationRun;
use super::{acquire_machine_set, final_global_state, launch, prepare_machine, ValidationSpawner};
use crate::config::JitSpawnerConfig;
use crate::engine::MachineBackend;
use crate::error::{Result, ValidatorError};
use crate::loader::MachineSetLoader;
use crate::machine::{Deadline, MachineHandle};
use crate::metrics::ValidatorMetrics;
use crate::types::{GlobalState, ModuleRoot, ValidationInput};

const NAME: &str = "jit";

pub struct JitSpawner {
    backend: Arc<dyn MachineBackend>,
    loader: Arc<MachineSetLoader>,
    config: JitSpawnerConfig,
    pool: WorkerPool,
    metrics: Arc<ValidatorMetrics>,
    fatal: mpsc::Sender<ValidatorError>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl JitSpawner {
    pub fn new(
        backend: Arc<dyn MachineBackend>,
        loader: Arc<MachineSetLoader>,
        config: JitSpawnerConfig,
        metrics: Arc<ValidatorMetrics>,
        fatal: mpsc::Sender<ValidatorError>,
    ) -> Self {
        let pool = WorkerPool::new(NAME, config.worker_count(), Arc::clone(&metrics));
        Self {
            backend,
            loader,
            config,
            pool,
            metrics,
            fatal,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn check_backend(&self) -> Result<()> {
        self.backend.probe()?;
        if !self.backend.supports_jit() {
            return Err(ValidatorError::EngineUnavailable(format!(
                "{} backend has no JIT support",
                self.backend.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ValidationSpawner for JitSpawner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self) -> Result<()> {
        if let Err(e) = self.check_backend() {
            let fatal = match e {
                ValidatorError::EngineUnavailable(_) => e,
                other => ValidatorError::EngineUnavailable(other.to_string()),
            };
            error!(backend = self.backend.name(), "JIT spawner unavailable: {}", fatal);
            // The receiver may be gone; the caller still gets the error.
            let _ = self.fatal.try_send(fatal.clone());
            return Err(fatal);
        }
        self.started.store(true, Ordering::Release);
        info!(
            backend = self.backend.name(),
            workers = self.pool.size(),
            "JIT spawner started"
        );
        Ok(())
    }

    fn execute_run(&self, module_root: ModuleRoot, input: ValidationInput) -> ValidationRun {
        let loader = Arc::clone(&self.loader);
        let pool = self.pool.clone();
        let timeout = self.config.run_timeout();
        let started = self.started.load(Ordering::Acquire);

        launch(
            NAME,
            module_root,
            input.id,
            &self.shutdown,
            Arc::clone(&self.metrics),
            move |cancel| async move {
                if !started {
                    return Err(ValidatorError::EngineUnavailable(
                        "JIT spawner was not started".to_string(),
                    ));
                }
                let (set, deadline) =
                    acquire_machine_set(&loader, module_root, &cancel, timeout).await?;
                pool.run(&cancel, move || {
                    let machine = set.zero_step().clone_handle()?;
                    let outcome = run_native(&machine, input, &deadline);
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
        info!("JIT spawner stopped");
    }
}

fn run_native(machine: &MachineHandle, input: ValidationInput, deadline: &Deadline) -> Result<GlobalState> {
    prepare_machine(machine, input)?;
    machine.step(deadline, u64::MAX)?;
    final_global_state(machine)
}
