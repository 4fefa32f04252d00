//! Locating machine images on disk.
//!
//! Layout: `<root>/<0x-module-root>/{machine image, host-io snapshot,
//! module-root.txt}` plus an optional `<root>/latest` directory (usually a
//! symlink) naming the newest module root.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, ValidatorError};
use crate::types::ModuleRoot;

const MODULE_ROOT_FILE: &str = "module-root.txt";
const LATEST_DIR: &str = "latest";

#[derive(Debug, Clone)]
pub struct MachineLocator {
    root_path: PathBuf,
    latest: Option<ModuleRoot>,
    module_roots: BTreeSet<ModuleRoot>,
}

impl MachineLocator {
    /// Resolve `root_path` (or search the default locations when it is empty)
    /// and index the module roots found there.
    pub fn new(root_path: &Path) -> Result<Self> {
        let root_path = if root_path.as_os_str().is_empty() {
            search_default_root()?
        } else {
            root_path.to_path_buf()
        };
        if !root_path.is_dir() {
            return Err(ValidatorError::Config(format!(
                "machine root path {} is not a directory",
                root_path.display()
            )));
        }

        let mut module_roots = BTreeSet::new();
        for entry in std::fs::read_dir(&root_path)? {
            let entry = entry?;
            if entry.file_name() == LATEST_DIR {
                continue;
            }
            let marker = entry.path().join(MODULE_ROOT_FILE);
            if !marker.is_file() {
                continue;
            }
            match read_module_root(&marker) {
                Ok(root) => {
                    debug!(module_root = %root, "Found machine directory");
                    module_roots.insert(root);
                }
                Err(e) => warn!(path = %marker.display(), "Ignoring unreadable module root: {}", e),
            }
        }

        let latest_marker = root_path.join(LATEST_DIR).join(MODULE_ROOT_FILE);
        let latest = if latest_marker.is_file() {
            Some(read_module_root(&latest_marker)?)
        } else {
            None
        };

        info!(
            root = %root_path.display(),
            count = module_roots.len(),
            latest = ?latest,
            "Indexed machine directories"
        );
        Ok(Self {
            root_path,
            latest,
            module_roots,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory holding the images for `module_root`. It need not exist.
    pub fn get_machine_path(&self, module_root: ModuleRoot) -> PathBuf {
        self.root_path.join(module_root.to_string())
    }

    pub fn latest_module_root(&self) -> Option<ModuleRoot> {
        self.latest
    }

    /// Module roots indexed when the locator was created.
    pub fn module_roots(&self) -> Vec<ModuleRoot> {
        self.module_roots.iter().copied().collect()
    }
}

fn read_module_root(path: &Path) -> Result<ModuleRoot> {
    std::fs::read_to_string(path)?.trim().parse()
}

fn search_default_root() -> Result<PathBuf> {
    let mut candidates = vec![PathBuf::from("machines")];
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join("machines"));
        candidates.push(exe_dir.join("..").join("machines"));
    }
    candidates
        .into_iter()
        .find(|dir| dir.is_dir())
        .ok_or_else(|| {
            ValidatorError::Config(
                "no machine root path configured and no default machines directory found"
                    .to_string(),
            )
        })
}
