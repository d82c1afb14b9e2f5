//! scenerun - main entry point
//!
//! Runs a single Play on this host: frames become child processes, the Play is
//! kept as JSON under the state directory, and provisioned objects live next
//! to it. Running the same manifest again after a crash resumes the stored
//! Play instead of starting over.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use scenerun::cli::{Cli, Commands};
use scenerun::config::{BackendKind, EngineConfig, ExecutionMode};
use scenerun::controller::Controller;
use scenerun::engine::Engine;
use scenerun::phase::PlayPhase;
use scenerun::process_guard::{self, ProcessGuard};
use scenerun::provision::DirectoryProvisioner;
use scenerun::scheduler::{self, StatusWriter, local::LocalProcessBackend};
use scenerun::store::{FileStore, PlayStore};
use scenerun::types::Play;

/// Initialize the logger; `RUST_LOG` overrides the default `info` level
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logger();

    // Frame processes are torn down on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let cli = Cli::parse_args();
    debug!(?cli, "CLI arguments parsed");

    match &cli.command {
        Commands::JobName { play, frame } => {
            println!("{}", scheduler::job_name(play, frame));
        }
        Commands::Validate { play } => {
            let config = load_config(&cli)?;
            match load_play(play, &config.namespace).and_then(|p| p.validate().map_err(Into::into)) {
                Ok(()) => println!("✓ Play manifest is valid: {}", play.display()),
                Err(e) => {
                    error!("Play validation failed: {:#}", e);
                    eprintln!("✗ Play validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Run { play, timeout } => {
            let config = load_config(&cli)?;
            let phase = run_play(&config, play, timeout.map(Duration::from_secs))?;
            if phase != PlayPhase::Complete {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if cli.blocking {
        config.execution_mode = ExecutionMode::Blocking;
    }
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

/// Reads a Play manifest, placing it in `namespace` unless it names its own.
fn load_play(path: &Path, namespace: &str) -> Result<Play> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read play manifest {:?}", path))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&content).context("Failed to parse play manifest JSON")?;
    if value.pointer("/metadata/namespace").is_none() {
        if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".to_string(), namespace.into());
        }
    }
    serde_json::from_value(value).context("Play manifest does not describe a Play")
}

/// Drives the Play in `manifest` to a terminal phase and prints its status.
fn run_play(config: &EngineConfig, manifest: &Path, timeout: Option<Duration>) -> Result<PlayPhase> {
    if config.backend != BackendKind::Local {
        anyhow::bail!(
            "backend {} is not available from the command line; use {}",
            config.backend,
            BackendKind::Local
        );
    }

    let play = load_play(manifest, &config.namespace)?;
    let store: Arc<dyn PlayStore> = Arc::new(
        FileStore::open(config.plays_dir())
            .with_context(|| format!("Failed to open play store in {:?}", config.plays_dir()))?,
    );
    let provisioner = Arc::new(
        DirectoryProvisioner::new(config.objects_dir())
            .with_context(|| format!("Failed to open object directory {:?}", config.objects_dir()))?,
    );

    let key = play.key();
    match store.get(&key) {
        Ok(existing) => info!(
            play = %key,
            phase = ?existing.phase(),
            "play already stored, resuming"
        ),
        Err(e) if e.is_not_found() => {
            store.create(play).context("Failed to store play")?;
            info!(play = %key, "play stored");
        }
        Err(e) => return Err(e).context("Failed to read play store"),
    }

    // Children are terminated when this goes out of scope
    let _guard = ProcessGuard::new();

    let writer = Arc::new(StatusWriter::new(
        Arc::clone(&store),
        config.status_retry_limit,
    ));
    let mut backend = LocalProcessBackend::new(writer, provisioner.clone());
    if let Some(dir) = &config.work_dir {
        backend = backend.with_work_dir(dir);
    }
    let engine = Engine::new(Arc::clone(&store), Arc::new(backend), provisioner)
        .with_mode(config.execution_mode)
        .with_requeue_interval(config.requeue_interval());
    info!(
        runner = %engine.runner_id(),
        mode = %config.execution_mode,
        state_dir = ?config.state_dir,
        "engine ready"
    );

    let controller = Controller::new(Arc::new(engine), config.requeue_interval())?;
    controller.run_until_terminal(std::slice::from_ref(&key), timeout)?;

    let play = store.get(&key).context("Play disappeared from the store")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&play.status).context("Failed to serialize play status")?
    );
    play.phase()
        .context("Play finished without a phase")
}
