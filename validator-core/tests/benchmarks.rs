//! Performance benchmarks for Validator Core.
//!
//! These tests measure timing for key operations and check that they stay
//! within generous bounds. Run with:
//!
//! ```sh
//! cargo test -p validator-core --test benchmarks -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use validator_core::engine::{Instruction, MachineBackend};
use validator_core::{
    Deadline, GlobalState, InboxKind, MachineFileConfig, MachineHandle, MachineLoader,
    ModuleRoot, PreimageResolverRegistry, ReferenceBackend, ReferenceImage, Result,
};

fn straight_line_program(steps: u64) -> Vec<Instruction> {
    let mut program: Vec<Instruction> = (0..steps).map(|v| Instruction::Mix { value: v }).collect();
    program.push(Instruction::Halt);
    program
}

fn load_handle(dir: &std::path::Path, program: Vec<Instruction>) -> MachineHandle {
    let files = MachineFileConfig::default();
    let root = ReferenceImage::new(program).install(dir, &files).unwrap();
    let image = validator_core::engine::reference::image_path(dir, root, &files);
    MachineHandle::new(ReferenceBackend::new().load_machine(&image).unwrap())
}

// ---------------------------------------------------------------------------
// Machine clone benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_clone_frozen_machine() {
    const ITERATIONS: usize = 10_000;
    let dir = tempfile::tempdir().unwrap();
    let source = load_handle(dir.path(), straight_line_program(1_000));
    source.freeze().unwrap();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let clone = source.clone_handle().unwrap();
        clone.destroy().unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_clone_frozen_machine] {ITERATIONS} clone+destroy in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter < Duration::from_millis(1),
        "clone+destroy should take < 1 ms, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Stepping and cancellation benchmarks
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_step_throughput() {
    const STEPS: u64 = 200_000;
    let dir = tempfile::tempdir().unwrap();
    let machine = load_handle(dir.path(), straight_line_program(STEPS));

    let start = Instant::now();
    machine.step(&Deadline::none(), u64::MAX).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(machine.step_count().unwrap(), STEPS + 1);
    let per_second = STEPS as f64 / elapsed.as_secs_f64();
    eprintln!("[bench_step_throughput] {STEPS} steps in {elapsed:?} ({per_second:.0} steps/s)");
    assert!(elapsed < Duration::from_secs(10), "stepping too slow: {elapsed:?}");
}

#[test]
#[ignore]
fn bench_cancellation_latency() {
    const ITERATIONS: usize = 20;
    let dir = tempfile::tempdir().unwrap();
    let machine = load_handle(
        dir.path(),
        vec![Instruction::Mix { value: 1 }, Instruction::Jump { target: 0 }],
    );

    let mut worst = Duration::ZERO;
    for _ in 0..ITERATIONS {
        let deadline = Deadline::after(Duration::from_millis(5));
        let start = Instant::now();
        let err = machine.step(&deadline, u64::MAX).unwrap_err();
        assert!(err.is_cancelled());
        worst = worst.max(start.elapsed().saturating_sub(Duration::from_millis(5)));
    }

    eprintln!("[bench_cancellation_latency] worst overshoot {worst:?} over {ITERATIONS} runs");
    assert!(
        worst < Duration::from_millis(100),
        "cancellation should land within 100 ms of the deadline, got {worst:?}"
    );
}

// ---------------------------------------------------------------------------
// Loader benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_loader_cached_lookups() {
    const LOOKUPS: usize = 100_000;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let loader = MachineLoader::new(Arc::new(|root: ModuleRoot| -> Result<u64> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(root.0[0] as u64)
    }));

    rt.block_on(async {
        loader.get_machine(ModuleRoot::ZERO).await.unwrap();
        let start = Instant::now();
        for _ in 0..LOOKUPS {
            loader.get_machine(ModuleRoot::ZERO).await.unwrap();
        }
        let elapsed = start.elapsed();
        let per_iter = elapsed / LOOKUPS as u32;
        eprintln!("[bench_loader_cached_lookups] {LOOKUPS} hits in {elapsed:?} ({per_iter:?}/iter)");
        assert!(per_iter < Duration::from_micros(50));
    });
    assert_eq!(loader.stats().builds, 1);
}

// ---------------------------------------------------------------------------
// Preimage registry benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_registry_resolve() {
    const ITERATIONS: usize = 100_000;
    let registry = Arc::new(PreimageResolverRegistry::new());
    let data = vec![7u8; 256];
    let token = registry.register(Arc::new(move |_| Ok(data.clone())));

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let hash = validator_core::Bytes32::digest(&i.to_be_bytes());
        registry.resolve(token, hash).unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;
    eprintln!("[bench_registry_resolve] {ITERATIONS} lookups in {elapsed:?} ({per_iter:?}/iter)");
    assert!(per_iter < Duration::from_micros(20));
}

// ---------------------------------------------------------------------------
// Full run benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_prepared_run() {
    const RUNS: usize = 200;
    let dir = tempfile::tempdir().unwrap();
    let mut program = straight_line_program(5_000);
    program.insert(
        100,
        Instruction::ReadInbox {
            kind: InboxKind::Sequencer,
        },
    );
    let source = load_handle(dir.path(), program);
    source.step_until_host_io(&Deadline::none()).unwrap();
    source.freeze().unwrap();

    let start = Instant::now();
    for i in 0..RUNS {
        let run = source.clone_handle().unwrap();
        run.set_global_state(GlobalState::default()).unwrap();
        run.add_sequencer_inbox_message(0, &i.to_be_bytes()).unwrap();
        run.step(&Deadline::none(), u64::MAX).unwrap();
        assert!(run.valid_for_step(u64::MAX).unwrap());
        run.destroy().unwrap();
    }
    let elapsed = start.elapsed();
    let per_run = elapsed / RUNS as u32;
    eprintln!("[bench_prepared_run] {RUNS} runs in {elapsed:?} ({per_run:?}/run)");
    assert!(per_run < Duration::from_millis(50));
}
