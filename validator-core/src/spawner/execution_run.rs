//! Proving sessions.
//!
//! An [`ExecutionRun`] answers "what does the machine look like at step N"
//! and "prove step N" for one input, as dispute bisection asks. It keeps a
//! frozen prepared machine at step 0 and a cursor clone. Requests at or past
//! the cursor step it forward; requests behind it restart the cursor from a
//! fresh clone of the prepared machine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pool::WorkerPool;
use crate::error::{Result, ValidatorError};
use crate::machine::{Deadline, MachineHandle};
use crate::types::{Bytes32, GlobalState, MachineStatus, ModuleRoot};

/// Machine summary at one step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    /// Steps actually executed. Below the requested position when the
    /// machine halted earlier.
    pub step: u64,
    pub hash: Bytes32,
    pub global_state: GlobalState,
    pub status: MachineStatus,
}

impl StepInfo {
    fn read(machine: &MachineHandle) -> Result<Self> {
        Ok(Self {
            step: machine.step_count()?,
            hash: machine.hash()?,
            global_state: machine.global_state()?,
            status: machine.status()?,
        })
    }
}

struct Session {
    module_root: ModuleRoot,
    prepared: MachineHandle,
    cursor: Mutex<MachineHandle>,
    step_chunk: u64,
}

impl Session {
    fn seek(&self, cursor: &mut MachineHandle, position: u64, deadline: &Deadline) -> Result<()> {
        if cursor.step_count()? > position {
            debug!(module_root = %self.module_root, position, "Restarting execution cursor");
            let fresh = self.prepared.clone_handle()?;
            let stale = std::mem::replace(cursor, fresh);
            let _ = stale.destroy();
        }
        let current = cursor.step_count()?;
        if current < position && cursor.is_running()? {
            cursor.step(deadline, position - current)?;
        }
        Ok(())
    }

    fn run_to_halt(&self, cursor: &MachineHandle, deadline: &Deadline) -> Result<()> {
        cursor.step_in_chunks(deadline, self.step_chunk)
    }

    /// Destroy the cursor unless a worker holds it. A worker that finds the
    /// session closed calls this again after releasing the lock.
    fn release_cursor(&self) {
        if let Some(cursor) = self.cursor.try_lock() {
            let _ = cursor.destroy();
        }
    }
}

pub struct ExecutionRun {
    session: Arc<Session>,
    pool: WorkerPool,
    cancel: CancellationToken,
}

impl ExecutionRun {
    pub(crate) fn new(
        module_root: ModuleRoot,
        prepared: MachineHandle,
        pool: WorkerPool,
        cancel: CancellationToken,
        step_chunk: u64,
    ) -> Result<Self> {
        let cursor = prepared.clone_handle()?;
        prepared.freeze()?;
        Ok(Self {
            session: Arc::new(Session {
                module_root,
                prepared,
                cursor: Mutex::new(cursor),
                step_chunk: step_chunk.max(1),
            }),
            pool,
            cancel,
        })
    }

    pub fn module_root(&self) -> ModuleRoot {
        self.session.module_root
    }

    /// Run `op` against the cursor on a pool worker.
    async fn with_cursor<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session, &mut MachineHandle, &Deadline) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let deadline = Deadline::from_token(self.cancel.clone());
        self.pool
            .run(&self.cancel, move || {
                let outcome = {
                    let mut cursor = session.cursor.lock();
                    if deadline.is_expired() {
                        Err(ValidatorError::Cancelled)
                    } else {
                        op(&session, &mut cursor, &deadline)
                    }
                };
                if deadline.is_expired() {
                    session.release_cursor();
                }
                outcome
            })
            .await
    }

    pub async fn get_step_at(&self, position: u64) -> Result<StepInfo> {
        self.with_cursor(move |session, cursor, deadline| {
            session.seek(cursor, position, deadline)?;
            StepInfo::read(cursor)
        })
        .await
    }

    /// One-step proof of the transition out of step `position`.
    pub async fn get_proof_at(&self, position: u64) -> Result<Vec<u8>> {
        self.with_cursor(move |session, cursor, deadline| {
            session.seek(cursor, position, deadline)?;
            cursor.prove_next_step()
        })
        .await
    }

    pub async fn get_last_step(&self) -> Result<StepInfo> {
        self.with_cursor(|session, cursor, deadline| {
            session.run_to_halt(cursor, deadline)?;
            StepInfo::read(cursor)
        })
        .await
    }

    /// Cancel any in-flight request and release both machines.
    ///
    /// Never waits for a request in progress; the worker serving it releases
    /// the cursor as soon as it returns.
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = self.session.prepared.destroy();
        self.session.release_cursor();
        debug!(module_root = %self.session.module_root, "Closed execution run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterpreterSpawnerConfig, MachineFileConfig};
    use crate::engine::{Instruction, ReferenceBackend, ReferenceImage};
    use crate::loader::{MachineLocator, MachineSetLoader};
    use crate::metrics::ValidatorMetrics;
    use crate::spawner::InterpreterSpawner;
    use crate::types::{InboxKind, ValidationInput};

    async fn session(dir: &std::path::Path) -> ExecutionRun {
        session_over(
            dir,
            vec![
                Instruction::Mix { value: 1 },
                Instruction::Mix { value: 2 },
                Instruction::ReadInbox {
                    kind: InboxKind::Sequencer,
                },
                Instruction::Mix { value: 3 },
                Instruction::Halt,
            ],
        )
        .await
    }

    async fn session_over(dir: &std::path::Path, program: Vec<Instruction>) -> ExecutionRun {
        let files = MachineFileConfig::default();
        let root = ReferenceImage::new(program).install(dir, &files).unwrap();
        let metrics = ValidatorMetrics::new();
        let loader = MachineSetLoader::new(
            Arc::new(ReferenceBackend::new()),
            Arc::new(MachineLocator::new(dir).unwrap()),
            files,
            Arc::clone(&metrics),
        );
        let spawner = InterpreterSpawner::new(
            Arc::new(loader),
            InterpreterSpawnerConfig::default(),
            metrics,
        );
        let input = ValidationInput::new(1, GlobalState::default()).with_sequencer_message(0, b"m".to_vec());
        spawner.create_execution_run(root, input).await.unwrap()
    }

    #[tokio::test]
    async fn test_steps_forward_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let run = session(dir.path()).await;

        let at_three = run.get_step_at(3).await.unwrap();
        assert_eq!(at_three.step, 3);
        assert_eq!(at_three.status, MachineStatus::Running);
        assert_eq!(at_three.global_state.batch, 1);

        let at_one = run.get_step_at(1).await.unwrap();
        assert_eq!(at_one.step, 1);
        assert_eq!(at_one.global_state.batch, 0);

        // Going back and forth lands on the same state.
        assert_eq!(run.get_step_at(3).await.unwrap(), at_three);
        run.close();
    }

    #[tokio::test]
    async fn test_last_step_and_positions_past_halt() {
        let dir = tempfile::tempdir().unwrap();
        let run = session(dir.path()).await;

        let last = run.get_last_step().await.unwrap();
        assert_eq!(last.status, MachineStatus::Finished);
        assert_eq!(last.step, 5);

        let beyond = run.get_step_at(1_000).await.unwrap();
        assert_eq!(beyond, last);
        run.close();
    }

    #[tokio::test]
    async fn test_proof_at_position() {
        let dir = tempfile::tempdir().unwrap();
        let run = session(dir.path()).await;

        let proof = run.get_proof_at(2).await.unwrap();
        assert!(!proof.is_empty());
        assert_eq!(run.get_proof_at(2).await.unwrap(), proof);
        assert_ne!(run.get_proof_at(0).await.unwrap(), proof);
        run.close();
    }

    #[tokio::test]
    async fn test_closed_run_rejects_requests() {
        let dir = tempfile::tempdir().unwrap();
        let run = session(dir.path()).await;
        run.close();
        assert_eq!(run.get_step_at(0).await, Err(ValidatorError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_during_request_releases_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let run = Arc::new(
            session_over(
                dir.path(),
                vec![
                    Instruction::ReadInbox {
                        kind: InboxKind::Sequencer,
                    },
                    Instruction::Mix { value: 5 },
                    Instruction::Jump { target: 1 },
                ],
            )
            .await,
        );

        let pending = {
            let run = Arc::clone(&run);
            tokio::spawn(async move { run.get_last_step().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        run.close();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), pending)
            .await
            .expect("request must stop after close")
            .unwrap();
        assert_eq!(outcome, Err(ValidatorError::Cancelled));
        assert!(run.session.prepared.is_destroyed());
        assert!(run.session.cursor.lock().is_destroyed());
    }
}
