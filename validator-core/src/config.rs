//! Validator configuration.
//!
//! Every section has a `Default` so a partial JSON document (or none at all)
//! yields a working node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ValidatorError};

/// Top-level configuration consumed by [`crate::ValidationNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ValidationConfig {
    /// Prefer the JIT spawner for plain validation, falling back to the
    /// interpreter when the engine cannot JIT.
    pub use_jit: bool,
    pub wasm: WasmConfig,
    pub machine: MachineFileConfig,
    pub interpreter: InterpreterSpawnerConfig,
    pub jit: JitSpawnerConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            use_jit: true,
            wasm: WasmConfig::default(),
            machine: MachineFileConfig::default(),
            interpreter: InterpreterSpawnerConfig::default(),
            jit: JitSpawnerConfig::default(),
        }
    }
}

impl ValidationConfig {
    /// Load a JSON configuration file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ValidatorError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ValidatorError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.machine.validate()?;
        if self.interpreter.step_chunk == 0 {
            return Err(ValidatorError::Config(
                "interpreter.step-chunk must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WasmConfig {
    /// Directory holding one subdirectory per module root. Empty means
    /// "search the usual places".
    pub root_path: PathBuf,
}

/// File names of the two artifacts inside a module root's directory, and
/// the limit on building a machine set from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MachineFileConfig {
    pub wavm_binary_path: String,
    pub until_host_io_state_path: String,
    /// Wall-clock limit for one machine set build in milliseconds, including
    /// stepping to the first host I/O. `0` disables it.
    pub build_timeout_ms: u64,
}

impl Default for MachineFileConfig {
    fn default() -> Self {
        Self {
            wavm_binary_path: "machine.wavm.br".to_string(),
            until_host_io_state_path: "until-host-io-state.bin".to_string(),
            build_timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl MachineFileConfig {
    pub fn build_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.build_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.wavm_binary_path.is_empty() || self.until_host_io_state_path.is_empty() {
            return Err(ValidatorError::Config(
                "machine file names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InterpreterSpawnerConfig {
    /// Concurrent runs. `0` means one per available core.
    pub workers: usize,
    /// Steps executed per `step` call between status checks.
    pub step_chunk: u64,
    /// Per-run timeout in milliseconds. `0` disables it.
    pub run_timeout_ms: u64,
}

impl Default for InterpreterSpawnerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            step_chunk: 1 << 20,
            run_timeout_ms: 0,
        }
    }
}

impl InterpreterSpawnerConfig {
    pub fn worker_count(&self) -> usize {
        resolve_workers(self.workers)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.run_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct JitSpawnerConfig {
    /// Concurrent runs. `0` means one per available core.
    pub workers: usize,
    /// Per-run timeout in milliseconds. `0` disables it.
    pub run_timeout_ms: u64,
}

impl JitSpawnerConfig {
    pub fn worker_count(&self) -> usize {
        resolve_workers(self.workers)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.run_timeout_ms)
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ValidationConfig::default();
        assert!(config.use_jit);
        assert_eq!(config.machine.wavm_binary_path, "machine.wavm.br");
        assert_eq!(
            config.machine.until_host_io_state_path,
            "until-host-io-state.bin"
        );
        assert!(config.interpreter.worker_count() >= 1);
        assert_eq!(config.interpreter.run_timeout(), None);
        assert_eq!(
            config.machine.build_timeout(),
            Some(Duration::from_secs(600))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "use-jit": false, "interpreter": { "workers": 3, "run-timeout-ms": 250 } }"#;
        let config: ValidationConfig = serde_json::from_str(json).unwrap();
        assert!(!config.use_jit);
        assert_eq!(config.interpreter.worker_count(), 3);
        assert_eq!(config.interpreter.step_chunk, 1 << 20);
        assert_eq!(
            config.interpreter.run_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.machine, MachineFileConfig::default());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator.json");
        std::fs::write(&path, r#"{ "wasm": { "root-path": "/srv/machines" } }"#).unwrap();

        let config = ValidationConfig::from_json_file(&path).unwrap();
        assert_eq!(config.wasm.root_path, PathBuf::from("/srv/machines"));
    }

    #[test]
    fn test_zero_build_timeout_disables_limit() {
        let json = r#"{ "machine": { "build-timeout-ms": 0 } }"#;
        let config: ValidationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.machine.build_timeout(), None);
        assert_eq!(config.machine.wavm_binary_path, "machine.wavm.br");
    }

    #[test]
    fn test_rejects_zero_step_chunk() {
        let mut config = ValidationConfig::default();
        config.interpreter.step_chunk = 0;
        assert!(matches!(config.validate(), Err(ValidatorError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ValidationConfig::from_json_file(Path::new("/nonexistent/validator.json"))
            .unwrap_err();
        assert!(matches!(err, ValidatorError::Config(_)));
    }
}
