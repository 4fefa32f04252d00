//! Validator Throughput Benchmark
//!
//! Installs a reference machine image in a scratch directory and measures:
//! - First build of a machine set versus cached lookups
//! - Sequential validation latency (interpreter and JIT)
//! - Concurrent validation throughput across the worker pool

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use validator_core::engine::Instruction;
use validator_core::{
    GlobalState, InboxKind, ModuleRoot, ReferenceBackend, ReferenceImage, ValidationConfig,
    ValidationInput, ValidationNode,
};

const PROGRAM_MIX_STEPS: u64 = 20_000;

fn benchmark_program() -> Vec<Instruction> {
    let mut program: Vec<Instruction> = (0..1_000).map(|v| Instruction::Mix { value: v }).collect();
    program.push(Instruction::ReadInbox {
        kind: InboxKind::Sequencer,
    });
    program.extend((0..PROGRAM_MIX_STEPS).map(|v| Instruction::Mix { value: v }));
    program.push(Instruction::ReadInbox {
        kind: InboxKind::Delayed,
    });
    program.push(Instruction::Halt);
    program
}

fn input(id: u64) -> ValidationInput {
    ValidationInput::new(id, GlobalState::default())
        .with_sequencer_message(0, format!("batch payload {id}").into_bytes())
        .with_delayed_message(0, b"delayed deposit".to_vec())
}

fn node_for(root: &std::path::Path, use_jit: bool) -> anyhow::Result<ValidationNode> {
    let mut config = ValidationConfig::default();
    config.use_jit = use_jit;
    config.wasm.root_path = root.to_path_buf();
    config.interpreter.step_chunk = 4_096;
    let (fatal_tx, _fatal_rx) = mpsc::channel(1);
    Ok(ValidationNode::new(config, Arc::new(ReferenceBackend::new()), fatal_tx)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║    Validator Throughput Benchmark                         ║");
    println!("╚═══════════════════════════════════════════════════════════╝\n");

    let dir = tempfile::tempdir()?;
    let module_root = ReferenceImage::new(benchmark_program())
        .install(dir.path(), &ValidationConfig::default().machine)?;
    println!("Installed module root {}\n", module_root);

    println!("📦 Benchmark 1: Machine Set Build vs Cache Hit");
    println!("═══════════════════════════════════════════════════════════");
    benchmark_loader(dir.path(), module_root).await?;
    println!();

    for (label, use_jit) in [("Interpreter", false), ("JIT", true)] {
        println!("⏱️  Benchmark 2: Sequential Validation ({label})");
        println!("═══════════════════════════════════════════════════════════");
        benchmark_sequential(dir.path(), module_root, use_jit).await?;
        println!();
    }

    println!("⚡ Benchmark 3: Concurrent Validation");
    println!("═══════════════════════════════════════════════════════════");
    let node = benchmark_concurrent(dir.path(), module_root).await?;
    println!();

    println!("📊 Final Metrics Report");
    println!("═══════════════════════════════════════════════════════════");
    node.metrics().snapshot().print_report();
    node.stop();
    Ok(())
}

async fn benchmark_loader(root: &std::path::Path, module_root: ModuleRoot) -> anyhow::Result<()> {
    const LOOKUPS: usize = 10_000;
    let node = node_for(root, false)?;

    let start = Instant::now();
    node.loader().get_machine(module_root).await?;
    let build = start.elapsed();

    let start = Instant::now();
    for _ in 0..LOOKUPS {
        node.loader().get_machine(module_root).await?;
    }
    let cached = start.elapsed();

    println!("First build:        {:.2?}", build);
    println!("Cached lookup avg:  {:.2?}", cached / LOOKUPS as u32);
    let stats = node.loader_stats();
    println!("Builds: {}, hits: {}", stats.builds, stats.hits);
    Ok(())
}

async fn benchmark_sequential(
    root: &std::path::Path,
    module_root: ModuleRoot,
    use_jit: bool,
) -> anyhow::Result<()> {
    const RUNS: u64 = 50;
    let node = node_for(root, use_jit)?;
    node.start().await?;
    node.loader().get_machine(module_root).await?;

    let start = Instant::now();
    for id in 0..RUNS {
        node.execute_run(module_root, input(id)).await_result(None).await?;
    }
    let elapsed = start.elapsed();
    let avg_ms = elapsed.as_secs_f64() * 1000.0 / RUNS as f64;
    println!("Spawner:            {}", node.execution_spawner().name());
    println!("Total time:         {:.2?}", elapsed);
    println!("Average per run:    {:.3}ms", avg_ms);
    println!("Runs per second:    {:.1}", 1000.0 / avg_ms);
    node.stop();
    Ok(())
}

async fn benchmark_concurrent(
    root: &std::path::Path,
    module_root: ModuleRoot,
) -> anyhow::Result<ValidationNode> {
    const RUNS: u64 = 200;
    let node = node_for(root, false)?;
    node.start().await?;
    println!("Worker slots:       {}", node.room());

    let start = Instant::now();
    let runs: Vec<_> = (0..RUNS).map(|id| node.execute_run(module_root, input(id))).collect();
    let mut distinct = std::collections::HashSet::new();
    for run in runs {
        distinct.insert(run.await_result(None).await?);
    }
    let elapsed = start.elapsed();

    println!("Total time:         {:.2?}", elapsed);
    println!("Runs per second:    {:.1}", RUNS as f64 / elapsed.as_secs_f64());
    println!("Distinct results:   {} (one per input)", distinct.len());
    Ok(node)
}
