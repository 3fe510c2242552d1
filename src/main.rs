//! TreeVis-RS - headless pipeline runner
//!
//! Runs a pipeline over a tree file and reports what would be drawn:
//!
//! ```text
//! treevis-rs [--install <package>]... [<pipeline.json>] <tree file>
//! ```
//!
//! Without a pipeline file the built-in default pipeline is used. Unverified
//! module or formatter code is only run after confirming on the terminal.

use anyhow::{bail, Context};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use treevis_rs::{
    config::{AppConfig, ModuleRoots},
    module::{CodePermission, PermissionDecision, PermissionRequest, Registry},
    pipeline::{InputFile, Pipeline, PipelineBridge, PipelineEvent, StageIndex},
    render::{HeadlessSurface, RenderCoordinator},
    tree::write_newick,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Asks on the terminal before running unverified code.
struct TerminalPermission;

impl CodePermission for TerminalPermission {
    fn ask_for_code_permission(&self, request: &PermissionRequest) -> PermissionDecision {
        let signer = request
            .public_key
            .as_ref()
            .map(|k| format!(" signed by {}", k.fingerprint()))
            .unwrap_or_default();
        eprint!(
            "{}{} could not be verified ({}). Run it? [y]es / [t]rust key / [N]o: ",
            request.subject, signer, request.reason
        );
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return PermissionDecision::Denied;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => PermissionDecision::Granted,
            "t" | "trust" if request.public_key.is_some() => PermissionDecision::GrantedAndTrusted,
            _ => PermissionDecision::Denied,
        }
    }
}

struct Args {
    packages: Vec<PathBuf>,
    pipeline: Option<PathBuf>,
    input: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut packages = Vec::new();
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--install" => packages.push(PathBuf::from(args.next().context("--install needs a path")?)),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let (pipeline, input) = match positional.len() {
        1 => (None, positional.remove(0)),
        2 => {
            let input = positional.remove(1);
            (Some(positional.remove(0)), input)
        }
        _ => bail!("usage: treevis-rs [--install <package>]... [<pipeline.json>] <tree file>"),
    };
    Ok(Args {
        packages,
        pipeline,
        input,
    })
}

fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default();
    let roots = ModuleRoots::from_config(&config)?;
    roots.ensure_dirs()?;

    // Initialize logging: terminal plus a daily file in the data directory
    let file_appender = tracing_appender::rolling::daily(&roots.logs_dir, "treevis.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,treevis_rs=debug")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    tracing::info!("Starting TreeVis-RS {}", env!("CARGO_PKG_VERSION"));
    let args = parse_args()?;

    let registry = Registry::open(roots, Arc::new(TerminalPermission), &config)?.with_builtins();
    for (path, error) in registry.load_installed() {
        tracing::warn!("Skipping installed module {:?}: {}", path, error);
    }
    for package in &args.packages {
        let module = registry
            .install(package, config.modules.verify_on_install)
            .with_context(|| format!("installing {:?}", package))?;
        tracing::info!("Installed {} ({}, {:?})", module.name, module.kind(), module.provenance);
    }
    let registry = Arc::new(registry);

    let surface = HeadlessSurface::new();
    let shown = surface.state();
    let coordinator = Arc::new(RenderCoordinator::start(Box::new(surface), config.min_pass_interval())?);
    let (bridge, observer) = PipelineBridge::new();
    let pipeline = Pipeline::new(registry)
        .with_sink(coordinator.clone())
        .with_observer(Arc::new(observer));

    if let Some(path) = &args.pipeline {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        match pipeline.load_config(&text)? {
            Some(provenance) => tracing::info!("Pipeline formatters authorized ({:?})", provenance),
            None => tracing::debug!("Pipeline formatters use defaults"),
        }
    }

    let text = std::fs::read_to_string(&args.input).with_context(|| format!("reading {:?}", args.input))?;
    let name = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    pipeline.set_input(InputFile::new(name, text));

    let summary = pipeline.run_from(StageIndex::Load)?;
    for event in bridge.drain() {
        if let PipelineEvent::StageFailed {
            stage,
            module_id,
            message,
        } = event
        {
            eprintln!("warning: {} ({}): {}", stage, module_id, message);
        }
    }

    // Let the coordinator present the final pass
    std::thread::sleep(config.min_pass_interval() + Duration::from_millis(50));

    if let Some(tree) = pipeline.final_tree() {
        println!("{}", write_newick(&tree));
    }
    let shown = shown.lock();
    println!(
        "{} stage(s) in {:?}, {} warning(s), {} layer(s) in {} pass(es), bounds {:?}",
        summary.stages_run,
        summary.elapsed,
        summary.warnings,
        shown.layers.len(),
        shown.passes.len(),
        coordinator.global_bounds()
    );
    Ok(())
}
