//! # qmdgate daemon
//!
//! One long-running process: loads the YAML config, probes the backend,
//! wires the orchestrator with its caches and CPU guard, starts the
//! scheduler / guardian / heartbeat loops, and serves the HTTP API until
//! SIGINT/SIGTERM, then shuts down within ten seconds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use qmdgate::api::{build_router, AppState};
use qmdgate::config::{self, Config};
use qmdgate::watchdog;
use qmdgate_cache::ResultCache;
use qmdgate_core::{Executor, HealthLevel};
use qmdgate_exec::{CliExecutor, SidecarExecutor};
use qmdgate_guard::CpuGuard;
use qmdgate_route::{CollectionRegistry, Orchestrator, OrchestratorDeps};
use qmdgate_sched::heartbeat::{Heartbeat, SelfHealer};
use qmdgate_sched::{Guardian, Scheduler};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "qmdgate")]
#[command(about = "Query-routing gateway for a qmd markdown retrieval backend")]
struct Cli {
    /// Path to config file
    #[arg(long, default_value = "/etc/qmdgate/qmdgate.yaml")]
    config: PathBuf,

    /// Print version information
    #[arg(short = 'v', long)]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!(
            "qmdgate {}\ncommit: {}",
            env!("CARGO_PKG_VERSION"),
            option_env!("QMDGATE_COMMIT").unwrap_or("unknown"),
        );
        return Ok(());
    }

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            eprintln!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    setup_logging(&cfg)?;

    info!(
        listen = %cfg.server.listen,
        collections = cfg.collections.len(),
        low_resource_mode = cfg.runtime.low_resource_mode,
        version = env!("CARGO_PKG_VERSION"),
        "qmdgate starting"
    );

    let cli_exec = match CliExecutor::new(cfg.exec_config()).await {
        Ok(exec) => exec,
        Err(err) => {
            error!(%err, "failed to initialize executor");
            std::process::exit(1);
        }
    };
    let exec: Arc<dyn Executor> = if cli_exec.has_capability(qmdgate_core::Capability::Sidecar) {
        Arc::new(SidecarExecutor::new(cli_exec, cfg.qmd.mcp_port))
    } else {
        Arc::new(cli_exec)
    };

    let registry = Arc::new(
        CollectionRegistry::new(cfg.collections.clone()).context("collection registry")?,
    );
    let cache = Arc::new(ResultCache::new(&cfg.cache_settings()));
    let guard = Arc::new(CpuGuard::new(cfg.cpu_guard_config()));
    let _guard_task = Arc::clone(&guard).start();

    let orch = Arc::new(Orchestrator::new(OrchestratorDeps {
        exec: Arc::clone(&exec),
        registry,
        cache: Arc::clone(&cache),
        guard,
        search: cfg.search_settings(),
        runtime: cfg.runtime_settings(),
    }));
    orch.ensure_collections().await;

    let negative_cleanup = {
        let orch = Arc::clone(&orch);
        Arc::new(move || orch.cleanup_deep_negative())
    };
    let sched = Arc::new(Scheduler::new(
        Arc::clone(&exec),
        cache,
        cfg.scheduler_intervals(),
        cfg.embed_enabled(),
        negative_cleanup,
    ));
    let _sched_tasks = Arc::clone(&sched).start();

    let guardian = Arc::new(Guardian::new(cfg.guardian_config(), Arc::clone(&exec)));
    let _guardian_task = Guardian::start(&guardian).await;

    let mut heartbeat = Heartbeat::new(Duration::from_secs(60));
    let healer = Arc::new(SelfHealer::new(
        Arc::clone(&exec),
        cfg.qmd.bin.clone(),
        cfg.qmd.index_db.clone(),
    ));
    {
        let healer_cli = Arc::clone(&healer);
        heartbeat.register(
            "qmd_cli",
            Box::new(move || {
                let healer = Arc::clone(&healer_cli);
                Box::pin(async move { healer.check_backend_cli().await })
            }),
        );
        let healer_db = Arc::clone(&healer);
        heartbeat.register(
            "index_db",
            Box::new(move || {
                let healer = Arc::clone(&healer_db);
                Box::pin(async move { healer.check_index_db() })
            }),
        );
        let healer_embed = Arc::clone(&healer);
        heartbeat.register(
            "embeddings",
            Box::new(move || {
                let healer = Arc::clone(&healer_embed);
                Box::pin(async move { healer.check_embeddings().await })
            }),
        );
        let orch_hb = Arc::clone(&orch);
        heartbeat.register(
            "cache",
            Box::new(move || {
                let healthy = orch_hb.cache_healthy();
                Box::pin(async move {
                    if healthy {
                        (HealthLevel::Healthy, String::new())
                    } else {
                        (HealthLevel::Unhealthy, "cache unhealthy".to_string())
                    }
                })
            }),
        );
        let guardian_hb = Arc::clone(&guardian);
        heartbeat.register(
            "mcp_daemon",
            Box::new(move || {
                let (level, msg) = guardian_hb.health();
                Box::pin(async move { (level, msg) })
            }),
        );
    }
    let health_tracker = heartbeat.tracker();
    let _heartbeat_task = heartbeat.start();

    let _watchdog_task = watchdog::spawn();

    let state = AppState {
        cfg: Arc::clone(&cfg),
        orch,
        exec,
        sched,
        guardian,
        health: health_tracker,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("bind {}", cfg.server.listen))?;
    info!(listen = %cfg.server.listen, pid = std::process::id(), "qmdgate ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("qmdgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    // Bound the drain: if open connections keep the graceful shutdown from
    // finishing, exit anyway after the grace period.
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!("graceful shutdown timed out, exiting");
        std::process::exit(0);
    });
}

fn setup_logging(cfg: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));

    if cfg.logging.file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
        return Ok(());
    }

    if let Some(dir) = std::path::Path::new(&cfg.logging.file).parent() {
        std::fs::create_dir_all(dir).ok();
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.logging.file)
        .with_context(|| format!("open log file {}", cfg.logging.file))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .json()
        .init();
    Ok(())
}
