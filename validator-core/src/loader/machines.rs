//! Machine sets: the two canonical snapshots of one module root.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LoaderStats, MachineLoader, MachineLocator};
use crate::config::MachineFileConfig;
use crate::engine::MachineBackend;
use crate::error::{Result, ValidatorError};
use crate::machine::{Deadline, MachineHandle};
use crate::metrics::{BuildTimer, ValidatorMetrics};
use crate::types::ModuleRoot;

/// Frozen zero-step and until-host-I/O machines for one module root.
///
/// Callers clone a member before doing anything that mutates it.
#[derive(Debug)]
pub struct MachineSet {
    zero_step: Arc<MachineHandle>,
    host_io: Arc<MachineHandle>,
}

impl MachineSet {
    pub fn zero_step(&self) -> &Arc<MachineHandle> {
        &self.zero_step
    }

    pub fn host_io(&self) -> &Arc<MachineHandle> {
        &self.host_io
    }
}

/// [`MachineLoader`] specialized to building [`MachineSet`]s from disk.
///
/// Each build runs under `build_timeout_ms` and the loader's shutdown token;
/// either firing fails the build with [`ValidatorError::BuildFailed`], which
/// clears the entry for a later retry.
pub struct MachineSetLoader {
    inner: MachineLoader<MachineSet>,
    locator: Arc<MachineLocator>,
    shutdown: CancellationToken,
}

impl MachineSetLoader {
    pub fn new(
        backend: Arc<dyn MachineBackend>,
        locator: Arc<MachineLocator>,
        files: MachineFileConfig,
        metrics: Arc<ValidatorMetrics>,
    ) -> Self {
        let build_locator = Arc::clone(&locator);
        let shutdown = CancellationToken::new();
        let build_shutdown = shutdown.clone();
        let build = Arc::new(move |module_root: ModuleRoot| -> Result<MachineSet> {
            let mut timer = BuildTimer::new(&metrics);
            let deadline =
                Deadline::with_timeout(build_shutdown.child_token(), files.build_timeout());
            let dir = build_locator.get_machine_path(module_root);
            let set = build_machine_set(backend.as_ref(), &dir, &files, module_root, &deadline)?;
            timer.succeeded();
            Ok(set)
        });
        Self {
            inner: MachineLoader::new(build),
            locator,
            shutdown,
        }
    }

    pub async fn get_machine(&self, module_root: ModuleRoot) -> Result<Arc<MachineSet>> {
        self.inner.get_machine(module_root).await
    }

    pub async fn get_zero_step_machine(&self, module_root: ModuleRoot) -> Result<Arc<MachineHandle>> {
        let set = self.get_machine(module_root).await?;
        Ok(Arc::clone(set.zero_step()))
    }

    pub async fn get_host_io_machine(&self, module_root: ModuleRoot) -> Result<Arc<MachineHandle>> {
        let set = self.get_machine(module_root).await?;
        Ok(Arc::clone(set.host_io()))
    }

    pub fn locator(&self) -> &MachineLocator {
        &self.locator
    }

    pub fn stats(&self) -> LoaderStats {
        self.inner.stats()
    }

    pub fn cached_roots(&self) -> Vec<ModuleRoot> {
        self.inner.cached_roots()
    }

    pub fn is_building(&self, module_root: ModuleRoot) -> bool {
        self.inner.is_building(module_root)
    }

    /// Abort in-flight builds and fail later ones. Ready sets stay usable.
    pub fn close(&self) {
        self.shutdown.cancel();
        info!("Machine loader closed");
    }
}

fn build_machine_set(
    backend: &dyn MachineBackend,
    dir: &Path,
    files: &MachineFileConfig,
    module_root: ModuleRoot,
    deadline: &Deadline,
) -> Result<MachineSet> {
    let fail = |reason: String| ValidatorError::build_failed(module_root, reason);
    if deadline.is_expired() {
        return Err(fail("loader is closed".to_string()));
    }

    let image = dir.join(&files.wavm_binary_path);
    if !image.is_file() {
        return Err(fail(format!("machine image {} not found", image.display())));
    }
    let native = backend
        .load_machine(&image)
        .map_err(|e| fail(format!("{} backend: {e}", backend.name())))?;
    let loaded_root = native.module_root();
    if loaded_root != module_root {
        return Err(fail(format!(
            "image {} has module root {loaded_root}",
            image.display()
        )));
    }

    let zero_step = MachineHandle::new(native);
    let host_io = zero_step
        .clone_handle()
        .map_err(|e| fail(e.to_string()))?;

    let snapshot = dir.join(&files.until_host_io_state_path);
    if snapshot.is_file() {
        debug!(%module_root, path = %snapshot.display(), "Restoring host-io snapshot");
        host_io
            .deserialize_and_replace_state(&snapshot)
            .map_err(|e| fail(e.to_string()))?;
    } else {
        debug!(%module_root, "No host-io snapshot, stepping to first host io");
        host_io.step_until_host_io(deadline).map_err(|e| match e {
            ValidatorError::Cancelled => {
                fail("machine did not reach host io within the build limit".to_string())
            }
            other => fail(other.to_string()),
        })?;
        if let Err(e) = host_io.serialize_state(&snapshot) {
            warn!(%module_root, path = %snapshot.display(), "Could not write host-io snapshot: {}", e);
        }
    }

    zero_step.freeze().map_err(|e| fail(e.to_string()))?;
    host_io.freeze().map_err(|e| fail(e.to_string()))?;
    Ok(MachineSet {
        zero_step: Arc::new(zero_step),
        host_io: Arc::new(host_io),
    })
}
