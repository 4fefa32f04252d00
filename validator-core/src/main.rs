//! valnode - standalone validation node
//!
//! Loads machines from the configured root path and either lists them,
//! validates one input file, or stays up serving until interrupted.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use validator_core::{
    init, DynamicBackend, MachineBackend, ModuleRoot, ReferenceBackend, ValidationConfig,
    ValidationInput, ValidationNode,
};

fn print_help() {
    println!("valnode - rollup state-transition validator v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  valnode [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>        JSON configuration file");
    println!("  -e, --engine <LIB>         Engine shared library (default: built-in reference engine)");
    println!("  -l, --list                 List module roots under the machine root path");
    println!("      --validate <INPUT>     Validate one JSON input file and print the final state");
    println!("      --module-root <HEX>    Module root for --validate (default: latest)");
    println!("  -h, --help                 Print this help message");
    println!("  -v, --version              Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  RUST_LOG                   Log filter (default: info)");
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    engine: Option<PathBuf>,
    list: bool,
    validate: Option<PathBuf>,
    module_root: Option<ModuleRoot>,
}

enum Command {
    Run(Args),
    Exit,
}

fn parse_args(raw: &[String]) -> Result<Command> {
    let mut args = Args::default();
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("'{}' requires a value", flag))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(Command::Exit);
            }
            "-v" | "--version" => {
                println!("valnode {}", env!("CARGO_PKG_VERSION"));
                return Ok(Command::Exit);
            }
            "-c" | "--config" => args.config = Some(PathBuf::from(value(arg.as_str())?)),
            "-e" | "--engine" => args.engine = Some(PathBuf::from(value(arg.as_str())?)),
            "-l" | "--list" => args.list = true,
            "--validate" => args.validate = Some(PathBuf::from(value(arg.as_str())?)),
            "--module-root" => {
                let hex = value(arg.as_str())?;
                let root = hex
                    .parse::<ModuleRoot>()
                    .with_context(|| format!("invalid module root '{}'", hex))?;
                args.module_root = Some(root);
            }
            other => bail!("unrecognized argument '{}'", other),
        }
    }
    if args.module_root.is_some() && args.validate.is_none() {
        bail!("'--module-root' only applies to '--validate'");
    }
    Ok(Command::Run(args))
}

/// Serve from the interpreter up front when the engine cannot JIT, instead
/// of starting the JIT spawner only to have it report a fatal error.
fn disable_unsupported_jit(config: &mut ValidationConfig, backend: &dyn MachineBackend) {
    if config.use_jit && !backend.supports_jit() {
        info!(backend = backend.name(), "Engine has no JIT support, using the interpreter");
        config.use_jit = false;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Exit) => return Ok(()),
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprintln!("Run 'valnode --help' for usage information.");
            std::process::exit(1);
        }
    };

    init();

    let mut config = match &args.config {
        Some(path) => ValidationConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => ValidationConfig::default(),
    };
    let backend: Arc<dyn MachineBackend> = match &args.engine {
        Some(path) => Arc::new(DynamicBackend::load(path)?),
        None => Arc::new(ReferenceBackend::new()),
    };
    disable_unsupported_jit(&mut config, backend.as_ref());

    let (fatal_tx, mut fatal_rx) = mpsc::channel(8);
    let node = ValidationNode::new(config, backend, fatal_tx).context("Failed to create validation node")?;
    node.start().await.context("Failed to start validation node")?;

    if args.list {
        let latest = node.latest_module_root();
        for root in node.wasm_module_roots() {
            let marker = if Some(root) == latest { " (latest)" } else { "" };
            println!("{}{}", root, marker);
        }
        return Ok(());
    }

    if let Some(input_path) = &args.validate {
        let input = ValidationInput::from_json_file(input_path)
            .with_context(|| format!("Failed to read validation input {:?}", input_path))?;
        let module_root = match args.module_root.or_else(|| node.latest_module_root()) {
            Some(root) => root,
            None => bail!("no --module-root given and no latest module root found"),
        };
        info!(%module_root, input = input.id, "Validating input");

        let run = node.execute_run(module_root, input);
        let outcome = run.await_result(None).await;
        node.metrics().snapshot().print_report();
        node.stop();
        let state = outcome.context("Validation failed")?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    info!("Validation node serving, press Ctrl-C to stop");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            Some(fatal) = fatal_rx.recv() => {
                error!("Fatal spawner error: {}", fatal);
                node.disable_jit();
            }
        }
    }
    node.stop();
    node.metrics().snapshot().print_report();
    Ok(())
}
