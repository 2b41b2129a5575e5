mod executors;
mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::Context;
use depbot_core::{
    audit::{AuditSource, NpmAudit},
    config::Config,
    db::Db,
    ecosystem::EcosystemRegistry,
    pipeline::Pipeline,
    pr_host::{GhCli, PrHost},
    scheduler::Scheduler,
    smart_scheduler::SmartScheduler,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use crate::executors::{OutdatedScanExecutor, PipelineJobExecutor};
use crate::logging::BroadcastLayer;

// ── AppState ──────────────────────────────────────────────────────────────

pub(crate) struct AppState {
    pub db: Arc<Db>,
    pub config: Config,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
    /// Pipeline and scheduler events, serialized for `/api/events`.
    pub event_tx: broadcast::Sender<String>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Scheduler,
    pub smart: SmartScheduler,
    pub registry: EcosystemRegistry,
    pub audits: Vec<Arc<dyn AuditSource>>,
}

impl AppState {
    /// Wire the engine, both schedulers and the event fan-out. Schedulers
    /// are constructed but not started.
    pub(crate) fn build(
        config: Config,
        db: Arc<Db>,
        pr_host: Arc<dyn PrHost>,
        log_tx: broadcast::Sender<String>,
        log_ring: Arc<Mutex<VecDeque<String>>>,
    ) -> Arc<Self> {
        let settings = config.pipeline_settings();
        let registry = EcosystemRegistry::standard(settings.install_limits());
        let audits: Vec<Arc<dyn AuditSource>> = vec![Arc::new(NpmAudit::new(settings.install_limits()))];
        let probe = settings.probe_limits();

        let (pipeline, pipeline_rx) = Pipeline::new(registry.clone(), pr_host, settings);
        let pipeline = Arc::new(pipeline);

        let (scheduler, scheduler_rx) = Scheduler::new(
            Arc::clone(&db),
            Arc::new(PipelineJobExecutor {
                pipeline: Arc::clone(&pipeline),
            }),
            config.scheduler_settings(),
        );
        let (smart, smart_rx) = SmartScheduler::new(
            Arc::clone(&db),
            Arc::new(OutdatedScanExecutor {
                registry: registry.clone(),
                audits: audits.clone(),
            }),
            config.scheduler_settings(),
            probe,
        );

        let (event_tx, _) = broadcast::channel(256);
        forward(pipeline_rx, event_tx.clone(), "pipeline");
        forward(scheduler_rx, event_tx.clone(), "scheduler");
        forward(smart_rx, event_tx.clone(), "smart_scheduler");

        Arc::new(Self {
            db,
            config,
            start_time: Instant::now(),
            log_tx,
            log_ring,
            event_tx,
            pipeline,
            scheduler,
            smart,
            registry,
            audits,
        })
    }
}

/// Re-publish typed events as JSON lines tagged with their source.
fn forward<E>(mut rx: broadcast::Receiver<E>, tx: broadcast::Sender<String>, source: &'static str)
where
    E: Serialize + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let line = json!({ "source": source, "event": event }).to_string();
                    let _ = tx.send(line);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{source} event forwarder lagged by {n}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(Mutex::new(VecDeque::with_capacity(logging::RING_CAPACITY)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depbot_server=info,depbot_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let env_config = Config::from_env()?;
    std::fs::create_dir_all(&env_config.data_dir)
        .with_context(|| format!("creating data dir {}", env_config.data_dir))?;
    let db = Arc::new(Db::open(&env_config.db_path())?);
    env_config.seed_db(&db)?;
    let config = env_config.load_from_db(&db);

    let settings = config.pipeline_settings();
    let pr_host: Arc<dyn PrHost> = Arc::new(GhCli::new(
        config.gh_bin.clone(),
        settings.probe_limits(),
        settings.push_limits(),
    ));

    let state = AppState::build(config, db, pr_host, log_tx, log_ring);

    let jobs = state.scheduler.initialize()?;
    let scans = state.smart.initialize()?;
    info!("scheduler armed {jobs} job(s), smart scheduler armed {scans} scan(s)");

    let addr = format!("{}:{}", state.config.web_bind, state.config.web_port);
    let app = routes::router(Arc::clone(&state));

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.cleanup();
    state.smart.cleanup();
    info!("schedulers stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
