//! CLI entry: argument parsing, logging setup, and the serve loop.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use vox_core::bridge::{self, BridgeState};
use vox_core::capture::device::CpalBackend;
use vox_core::channels::ChannelStore;
use vox_core::config::{EngineConfig, vox_home};
use vox_core::resources::PromptSource;
use vox_core::session::transport::WsTransport;
use vox_core::session::{ControllerDeps, SessionController};

#[derive(Debug, Parser)]
#[command(name = "vox", version, about = "Live multimodal voice session engine")]
struct Cli {
    /// Bridge bind address (host:port), overriding the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load()?;
    let _guard = init_tracing(&cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(serve(cli, config))
}

async fn serve(cli: Cli, config: EngineConfig) -> Result<()> {
    let api_key = config.api_key()?;
    let addr = cli.bind.unwrap_or_else(|| config.bind_addr.clone());

    let (events, _) = broadcast::channel(1024);
    let channels = Arc::new(ChannelStore::new(events.clone()));
    let deps = ControllerDeps {
        transport: Arc::new(WsTransport::new(&config.endpoint, api_key)),
        devices: Arc::new(CpalBackend),
        prompts: Arc::new(DirPrompts::default()),
    };
    let (controller, _controller_task) =
        SessionController::spawn(deps, Arc::clone(&channels), events.clone());

    let state = BridgeState {
        controller: controller.clone(),
        events,
    };

    eprintln!("vox bridge listening on ws://{addr}/ws");
    tokio::select! {
        result = bridge::serve(&addr, state) => result,
        () = shutdown_signal() => {
            tracing::info!("shutting down");
            controller.stop().await;
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })
    .expect("Error setting Ctrl+C handler");
    let _ = rx.recv().await;
}

fn init_tracing(level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = vox_home().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, "vox.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

/// Prompt catalog from `${VOX_HOME}/system_prompts/<category>/<name>.txt`.
#[derive(Debug, Default)]
struct DirPrompts;

impl PromptSource for DirPrompts {
    fn catalog(&self) -> BTreeMap<String, Vec<String>> {
        let root = vox_home().join("system_prompts");
        let mut catalog = BTreeMap::new();
        collect_prompts(&root, &mut catalog);
        catalog
    }
}

fn collect_prompts(root: &Path, catalog: &mut BTreeMap<String, Vec<String>>) {
    let Ok(categories) = fs::read_dir(root) else {
        return;
    };
    for category in categories.flatten() {
        let path = category.path();
        if !path.is_dir() {
            continue;
        }
        let name = category.file_name().to_string_lossy().into_owned();
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        let mut prompts: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        if prompts.is_empty() {
            continue;
        }
        prompts.sort();
        catalog.insert(name, prompts);
    }
}
