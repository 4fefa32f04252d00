//! Validation node - owns the loader and both spawners
//!
//! The node wires one machine backend to a [`MachineSetLoader`] shared by
//! the interpreter and JIT spawners, and picks which spawner serves runs.
//!
//! # Spawner selection:
//! - `use_jit = false`: interpreter only.
//! - `use_jit = true`: JIT if its backend passes the start-up probe,
//!   otherwise the failure goes out on the fatal channel and the node falls
//!   back to the interpreter.
//!
//! Proving sessions always use the interpreter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::engine::MachineBackend;
use crate::error::{Result, ValidatorError};
use crate::loader::{LoaderStats, MachineLocator, MachineSetLoader};
use crate::metrics::ValidatorMetrics;
use crate::spawner::{ExecutionRun, InterpreterSpawner, JitSpawner, ValidationRun, ValidationSpawner};
use crate::types::{ModuleRoot, ValidationInput};

pub struct ValidationNode {
    config: ValidationConfig,
    backend: Arc<dyn MachineBackend>,
    loader: Arc<MachineSetLoader>,
    interpreter: Arc<InterpreterSpawner>,
    jit: Option<Arc<JitSpawner>>,
    jit_active: AtomicBool,
    metrics: Arc<ValidatorMetrics>,
}

impl ValidationNode {
    /// Build a node. Nothing runs until [`start`](Self::start).
    ///
    /// `fatal` receives spawner-wide failures such as an unusable JIT engine.
    pub fn new(
        config: ValidationConfig,
        backend: Arc<dyn MachineBackend>,
        fatal: mpsc::Sender<ValidatorError>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = ValidatorMetrics::new();
        let locator = Arc::new(MachineLocator::new(&config.wasm.root_path)?);
        let loader = Arc::new(MachineSetLoader::new(
            Arc::clone(&backend),
            locator,
            config.machine.clone(),
            Arc::clone(&metrics),
        ));
        let interpreter = Arc::new(InterpreterSpawner::new(
            Arc::clone(&loader),
            config.interpreter.clone(),
            Arc::clone(&metrics),
        ));
        let jit = config.use_jit.then(|| {
            Arc::new(JitSpawner::new(
                Arc::clone(&backend),
                Arc::clone(&loader),
                config.jit.clone(),
                Arc::clone(&metrics),
                fatal,
            ))
        });

        Ok(Self {
            config,
            backend,
            loader,
            interpreter,
            jit,
            jit_active: AtomicBool::new(false),
            metrics,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            backend = self.backend.name(),
            root = %self.loader.locator().root_path().display(),
            use_jit = self.config.use_jit,
            "Starting validation node"
        );
        self.interpreter.start().await?;

        if let Some(jit) = &self.jit {
            match jit.start().await {
                Ok(()) => self.jit_active.store(true, Ordering::Release),
                Err(e) => warn!("JIT unavailable, falling back to interpreter: {}", e),
            }
        }
        info!(spawner = self.execution_spawner().name(), "Validation node ready");
        Ok(())
    }

    /// The spawner serving [`execute_run`](Self::execute_run).
    pub fn execution_spawner(&self) -> Arc<dyn ValidationSpawner> {
        match &self.jit {
            Some(jit) if self.jit_active.load(Ordering::Acquire) => Arc::clone(jit) as Arc<dyn ValidationSpawner>,
            _ => Arc::clone(&self.interpreter) as Arc<dyn ValidationSpawner>,
        }
    }

    /// Route later runs to the interpreter, e.g. after a fatal JIT report.
    pub fn disable_jit(&self) {
        if self.jit_active.swap(false, Ordering::AcqRel) {
            warn!("JIT disabled, new runs use the interpreter");
        }
    }

    pub fn execute_run(&self, module_root: ModuleRoot, input: ValidationInput) -> ValidationRun {
        self.execution_spawner().execute_run(module_root, input)
    }

    pub async fn create_execution_run(
        &self,
        module_root: ModuleRoot,
        input: ValidationInput,
    ) -> Result<ExecutionRun> {
        self.interpreter.create_execution_run(module_root, input).await
    }

    pub fn room(&self) -> usize {
        self.execution_spawner().room()
    }

    pub fn loader(&self) -> &MachineSetLoader {
        &self.loader
    }

    pub fn loader_stats(&self) -> LoaderStats {
        self.loader.stats()
    }

    /// Module roots found under the machine root path.
    pub fn wasm_module_roots(&self) -> Vec<ModuleRoot> {
        self.loader.locator().module_roots()
    }

    pub fn latest_module_root(&self) -> Option<ModuleRoot> {
        self.loader.locator().latest_module_root()
    }

    pub fn metrics(&self) -> &Arc<ValidatorMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn stop(&self) {
        if let Some(jit) = &self.jit {
            jit.stop();
        }
        self.interpreter.stop();
        self.loader.close();
        info!("Validation node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReferenceBackend;

    fn config_for(dir: &std::path::Path, use_jit: bool) -> ValidationConfig {
        let mut config = ValidationConfig::default();
        config.use_jit = use_jit;
        config.wasm.root_path = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_node_prefers_jit_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let node = ValidationNode::new(config_for(dir.path(), true), Arc::new(ReferenceBackend::new()), tx).unwrap();
        node.start().await.unwrap();
        assert_eq!(node.execution_spawner().name(), "jit");
        assert!(rx.try_recv().is_err());

        node.disable_jit();
        assert_eq!(node.execution_spawner().name(), "interpreter");
    }

    #[tokio::test]
    async fn test_interpreter_only_when_jit_off() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let node = ValidationNode::new(config_for(dir.path(), false), Arc::new(ReferenceBackend::new()), tx).unwrap();
        node.start().await.unwrap();
        assert_eq!(node.execution_spawner().name(), "interpreter");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), false);
        config.interpreter.step_chunk = 0;
        let (tx, _rx) = mpsc::channel(1);
        let err = ValidationNode::new(config, Arc::new(ReferenceBackend::new()), tx)
            .err()
            .unwrap();
        assert!(matches!(err, ValidatorError::Config(_)));
    }
}
