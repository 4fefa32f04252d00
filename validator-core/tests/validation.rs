//! End-to-end validation through [`ValidationNode`].

use std::path::Path;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use validator_core::engine::Instruction;
use validator_core::{
    Bytes32, GlobalState, InboxKind, MachineBackend, MachineStatus, ModuleRoot, NativeMachine,
    ReferenceBackend, ReferenceImage, Result, ValidationConfig, ValidationInput, ValidationNode,
    ValidatorError,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(30));

fn block_program() -> Vec<Instruction> {
    vec![
        Instruction::Mix { value: 1 },
        Instruction::Mix { value: 2 },
        Instruction::ReadInbox {
            kind: InboxKind::Sequencer,
        },
        Instruction::Mix { value: 3 },
        Instruction::ReadInbox {
            kind: InboxKind::Delayed,
        },
        Instruction::Halt,
    ]
}

fn block_input(id: u64) -> ValidationInput {
    ValidationInput::new(id, GlobalState::default())
        .with_sequencer_message(0, b"sequencer batch".to_vec())
        .with_delayed_message(0, b"delayed message".to_vec())
}

fn install(dir: &Path, program: Vec<Instruction>) -> ModuleRoot {
    ReferenceImage::new(program)
        .install(dir, &ValidationConfig::default().machine)
        .unwrap()
}

fn config(dir: &Path, use_jit: bool) -> ValidationConfig {
    let mut config = ValidationConfig::default();
    config.use_jit = use_jit;
    config.wasm.root_path = dir.to_path_buf();
    config.interpreter.workers = 4;
    config.jit.workers = 4;
    config
}

async fn started_node(
    config: ValidationConfig,
    backend: ReferenceBackend,
) -> (ValidationNode, mpsc::Receiver<ValidatorError>) {
    started_node_with(config, Arc::new(backend)).await
}

async fn started_node_with(
    config: ValidationConfig,
    backend: Arc<dyn MachineBackend>,
) -> (ValidationNode, mpsc::Receiver<ValidatorError>) {
    let (tx, rx) = mpsc::channel(4);
    let node = ValidationNode::new(config, backend, tx).unwrap();
    node.start().await.unwrap();
    (node, rx)
}

const POISON: &[u8] = b"poison batch";

/// Reference engine whose machines panic when fed [`POISON`].
struct PoisonableBackend(ReferenceBackend);

struct PoisonableMachine(Box<dyn NativeMachine>);

impl MachineBackend for PoisonableBackend {
    fn name(&self) -> &str {
        "poisonable"
    }

    fn load_machine(&self, image: &Path) -> Result<Box<dyn NativeMachine>> {
        Ok(Box::new(PoisonableMachine(self.0.load_machine(image)?)))
    }
}

impl NativeMachine for PoisonableMachine {
    fn clone_machine(&self) -> Result<Box<dyn NativeMachine>> {
        Ok(Box::new(PoisonableMachine(self.0.clone_machine()?)))
    }

    fn step(&mut self, count: u64, interrupt: &AtomicU8) -> Result<()> {
        self.0.step(count, interrupt)
    }

    fn step_until_host_io(&mut self, interrupt: &AtomicU8) -> Result<()> {
        self.0.step_until_host_io(interrupt)
    }

    fn hash(&self) -> Bytes32 {
        self.0.hash()
    }

    fn module_root(&self) -> Bytes32 {
        self.0.module_root()
    }

    fn global_state(&self) -> GlobalState {
        self.0.global_state()
    }

    fn set_global_state(&mut self, state: GlobalState) {
        self.0.set_global_state(state)
    }

    fn step_count(&self) -> u64 {
        self.0.step_count()
    }

    fn status(&self) -> MachineStatus {
        self.0.status()
    }

    fn prove_next_step(&self) -> Vec<u8> {
        self.0.prove_next_step()
    }

    fn serialize_state(&self, path: &Path) -> Result<()> {
        self.0.serialize_state(path)
    }

    fn deserialize_and_replace_state(&mut self, path: &Path) -> Result<()> {
        self.0.deserialize_and_replace_state(path)
    }

    fn add_inbox_message(&mut self, kind: InboxKind, index: u64, data: &[u8]) -> Result<()> {
        if data == POISON {
            panic!("engine crashed on inbox message {index}");
        }
        self.0.add_inbox_message(kind, index, data)
    }

    fn set_resolver_context(&mut self, token: u64) {
        self.0.set_resolver_context(token)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_runs_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let first = node.execute_run(root, block_input(1));
    let second = node.execute_run(root, block_input(2));
    let a = first.await_result(WAIT).await.unwrap();
    let b = second.await_result(WAIT).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(a.batch, 1);
    assert_eq!(a.pos_in_batch, 1);
    assert_ne!(a.block_hash, Bytes32::ZERO);
    // Both runs shared one build.
    assert_eq!(node.loader_stats().builds, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jit_and_interpreter_agree() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());

    let (jit, _fatal) = started_node(config(dir.path(), true), ReferenceBackend::new()).await;
    assert_eq!(jit.execution_spawner().name(), "jit");
    let (interp, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let a = jit.execute_run(root, block_input(1)).await_result(WAIT).await.unwrap();
    let b = interp.execute_run(root, block_input(1)).await_result(WAIT).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_missing_images_then_supplied() {
    let dir = tempfile::tempdir().unwrap();
    let image = ReferenceImage::new(block_program());
    let root = image.module_root();
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let err = node
        .execute_run(root, block_input(1))
        .await_result(WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, ValidatorError::BuildFailed { module_root, .. } if module_root == root));
    assert!(err.is_retryable());

    image
        .install(dir.path(), &ValidationConfig::default().machine)
        .unwrap();
    let state = node
        .execute_run(root, block_input(2))
        .await_result(WAIT)
        .await
        .unwrap();
    assert_eq!(state.batch, 1);
    assert_eq!(node.loader_stats().failures, 1);
}

#[tokio::test]
async fn test_jit_falls_back_to_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let (node, mut fatal) =
        started_node(config(dir.path(), true), ReferenceBackend::without_jit()).await;

    let reported = fatal.recv().await.unwrap();
    assert!(matches!(reported, ValidatorError::EngineUnavailable(_)));
    assert_eq!(node.execution_spawner().name(), "interpreter");

    let state = node
        .execute_run(root, block_input(1))
        .await_result(WAIT)
        .await
        .unwrap();
    assert_eq!(state.batch, 1);
}

#[tokio::test]
async fn test_run_timeout_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(
        dir.path(),
        vec![
            Instruction::ReadInbox {
                kind: InboxKind::Sequencer,
            },
            Instruction::Jump { target: 1 },
        ],
    );
    let mut cfg = config(dir.path(), false);
    cfg.interpreter.run_timeout_ms = 100;
    cfg.interpreter.step_chunk = 10_000;
    let (node, _fatal) = started_node(cfg, ReferenceBackend::new()).await;

    let outcome = node
        .execute_run(root, block_input(1))
        .await_result(WAIT)
        .await;
    assert_eq!(outcome, Err(ValidatorError::Cancelled));
    assert_eq!(node.metrics().snapshot().runs_cancelled, 1);
}

#[tokio::test]
async fn test_preimages_flow_through_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let mut input = block_input(1);
    let hash = input.add_preimage(b"keccak preimage".to_vec());
    let mut program = block_program();
    program.insert(3, Instruction::ReadPreimage { hash });
    let root = install(dir.path(), program);
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let with_preimage = node
        .execute_run(root, input)
        .await_result(WAIT)
        .await
        .unwrap();
    assert_ne!(with_preimage.send_root, Bytes32::ZERO);

    let err = node
        .execute_run(root, block_input(2))
        .await_result(WAIT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ValidatorError::PreimageResolutionFailed { hash: missing, .. } if missing == hash
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_runs() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let runs: Vec<_> = (0..32)
        .map(|id| {
            let input = ValidationInput::new(id, GlobalState::default())
                .with_sequencer_message(0, format!("batch {id}").into_bytes())
                .with_delayed_message(0, b"d".to_vec());
            node.execute_run(root, input)
        })
        .collect();

    let mut states = Vec::new();
    for run in runs {
        states.push(run.await_result(WAIT).await.unwrap());
    }
    // Distinct inputs give distinct block hashes.
    let distinct: std::collections::HashSet<_> = states.iter().map(|s| s.block_hash).collect();
    assert_eq!(distinct.len(), 32);

    let snapshot = node.metrics().snapshot();
    assert_eq!(snapshot.runs_launched, 32);
    assert_eq!(snapshot.runs_succeeded, 32);
    assert_eq!(snapshot.machine_builds, 1);
    assert_eq!(node.room(), 4);
}

#[tokio::test]
async fn test_execution_run_matches_validation() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let (node, _fatal) = started_node(config(dir.path(), true), ReferenceBackend::new()).await;

    let validated = node
        .execute_run(root, block_input(1))
        .await_result(WAIT)
        .await
        .unwrap();

    let session = node.create_execution_run(root, block_input(1)).await.unwrap();
    let last = session.get_last_step().await.unwrap();
    assert_eq!(last.status, MachineStatus::Finished);
    assert_eq!(last.global_state, validated);
    assert_eq!(last.step, 6);

    let midway = session.get_step_at(3).await.unwrap();
    assert_eq!(midway.global_state.batch, 1);
    assert_eq!(midway.global_state.pos_in_batch, 0);
    assert!(!session.get_proof_at(3).await.unwrap().is_empty());
    session.close();
}

#[tokio::test]
async fn test_stopped_node_cancels_runs() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;
    node.stop();

    let outcome = node
        .execute_run(root, block_input(1))
        .await_result(WAIT)
        .await;
    assert_eq!(outcome, Err(ValidatorError::Cancelled));
}

#[tokio::test]
async fn test_locator_lists_installed_roots() {
    let dir = tempfile::tempdir().unwrap();
    let a = install(dir.path(), block_program());
    let b = install(dir.path(), vec![Instruction::Halt]);
    let (node, _fatal) = started_node(config(dir.path(), false), ReferenceBackend::new()).await;

    let roots = node.wasm_module_roots();
    assert!(roots.contains(&a));
    assert!(roots.contains(&b));
    assert_eq!(node.latest_module_root(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_panic_fails_only_its_run() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(dir.path(), block_program());
    let backend = Arc::new(PoisonableBackend(ReferenceBackend::new()));
    let (node, _fatal) = started_node_with(config(dir.path(), false), backend).await;
    let expected = node
        .execute_run(root, block_input(0))
        .await_result(WAIT)
        .await
        .unwrap();

    let poisoned = node.execute_run(
        root,
        ValidationInput::new(99, GlobalState::default())
            .with_sequencer_message(0, POISON.to_vec())
            .with_delayed_message(0, b"delayed message".to_vec()),
    );
    let healthy: Vec<_> = (1..=8)
        .map(|id| node.execute_run(root, block_input(id)))
        .collect();

    let err = poisoned.await_result(WAIT).await.unwrap_err();
    assert!(matches!(&err, ValidatorError::NativeEngineFault(msg) if msg.contains("panicked")));
    for run in healthy {
        assert_eq!(run.await_result(WAIT).await.unwrap(), expected);
    }

    let snapshot = node.metrics().snapshot();
    assert_eq!(snapshot.worker_panics, 1);
    assert_eq!(snapshot.runs_succeeded, 9);
    assert_eq!(snapshot.runs_failed, 1);
    assert_eq!(node.room(), 4);

    // The pool keeps serving after the panic.
    let after = node
        .execute_run(root, block_input(10))
        .await_result(WAIT)
        .await
        .unwrap();
    assert_eq!(after, expected);
}

#[tokio::test]
async fn test_endless_build_times_out_runs_and_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let root = install(
        dir.path(),
        vec![Instruction::Mix { value: 1 }, Instruction::Jump { target: 0 }],
    );
    let mut cfg = config(dir.path(), false);
    cfg.interpreter.run_timeout_ms = 100;
    cfg.machine.build_timeout_ms = 300;
    let (node, _fatal) = started_node(cfg, ReferenceBackend::new()).await;

    let first = tokio::time::timeout(
        Duration::from_secs(2),
        node.execute_run(root, block_input(1)).await_result(None),
    )
    .await
    .expect("run timeout must cover waiting for machines");
    assert_eq!(first, Err(ValidatorError::Cancelled));

    // The build gives up at its own limit and clears the entry.
    let mut waited = Duration::ZERO;
    while node.loader().is_building(root) && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert!(!node.loader().is_building(root));
    assert_eq!(node.loader_stats().failures, 1);

    let second = tokio::time::timeout(
        Duration::from_secs(2),
        node.execute_run(root, block_input(2)).await_result(None),
    )
    .await
    .expect("retried run must also time out");
    assert_eq!(second, Err(ValidatorError::Cancelled));
    assert_eq!(node.loader_stats().builds, 2);
    node.stop();
}
