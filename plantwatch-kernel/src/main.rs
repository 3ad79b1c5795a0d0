/**
 * PLANTWATCH KERNEL - Point d'entrée
 *
 * ORDRE DE DÉMARRAGE :
 * .env → logs → config → runtime tokio (taille fixée par la config) → stores →
 * ingestion → collecte → bridge + restauration des plans → MQTT → health → HTTP.
 *
 * ARRÊT (Ctrl-C) : plus de nouvelles exécutions de jobs, fermeture de la session
 * MQTT, puis flush final du buffer de lectures.
 */

use anyhow::Context;
use plantwatch_kernel::bridge::{restore_plans, LifecycleBridge};
use plantwatch_kernel::collector::HttpCollector;
use plantwatch_kernel::config::{load_config, KernelConfig};
use plantwatch_kernel::health::HealthTracker;
use plantwatch_kernel::http::{self, AppState};
use plantwatch_kernel::ingest::BatchIngestor;
use plantwatch_kernel::mqtt;
use plantwatch_kernel::publisher::MqttPublisher;
use plantwatch_kernel::scheduler::JobRegistry;
use plantwatch_kernel::store::{JsonPlanStore, JsonlReadingStore, PlanStore, ReadingStore};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantwatch_kernel=info")),
        )
        .init();

    let cfg = load_config();
    let workers = cfg.runtime.worker_threads.max(1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("plantwatch-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    info!(workers, "runtime ready");
    runtime.block_on(run(cfg))
}

async fn run(cfg: KernelConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let health_tracker = HealthTracker::new();

    // stores
    let reading_store: Arc<dyn ReadingStore> = Arc::new(
        JsonlReadingStore::open(&cfg.storage.path)
            .await
            .context("failed to open reading store")?,
    );
    let plan_store: Arc<dyn PlanStore> = match JsonPlanStore::open(&cfg.plans.path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %cfg.plans.path, error = %e, "failed to read plan store, starting without persisted plans");
            Arc::new(JsonPlanStore::empty(&cfg.plans.path))
        }
    };

    // session MQTT unique (publication des lectures + commandes + health)
    let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);

    // étage ingestion
    let ingestor = Arc::new(BatchIngestor::new(reading_store, &cfg.ingest));
    let (readings_tx, readings_rx) = mpsc::channel(cfg.ingest.channel_capacity.max(1));
    let flush_timer = ingestor.spawn_flush_timer(shutdown.clone());
    let consumer = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move { ingestor.consume(readings_rx).await })
    };

    // étage collecte
    let collector = Arc::new(HttpCollector::new(&cfg.collector).context("failed to build HTTP collector")?);
    let publisher = Arc::new(MqttPublisher::new(
        mqtt_client.clone(),
        cfg.topics.clone(),
        Duration::from_secs(cfg.publisher.timeout_secs),
    ));
    let registry = Arc::new(JobRegistry::new(collector, publisher));

    let mirror = cfg.plans.mirror_commands.then(|| plan_store.clone());
    let bridge = Arc::new(LifecycleBridge::start(registry.clone(), mirror, cfg.bridge.shards));

    match restore_plans(plan_store.as_ref(), &registry).await {
        Ok(report) => info!(restored = report.restored, failed = report.failed, total = report.total, "plans restored"),
        Err(e) => error!(error = %e, "failed to load persisted plans, starting without jobs"),
    }

    let listener_task = mqtt::spawn_mqtt_listener(
        mqtt_client.clone(),
        eventloop,
        cfg.topics.clone(),
        bridge.clone(),
        readings_tx,
        health_tracker.clone(),
        shutdown.clone(),
    );

    health_tracker.spawn_health_publisher(
        mqtt_client,
        cfg.topics.health.clone(),
        Duration::from_secs(cfg.http.health_publish_secs),
        registry.clone(),
        ingestor.clone(),
        shutdown.clone(),
    );

    let api_key = std::env::var("PLANTWATCH_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("PLANTWATCH_API_KEY not set, admin API limited to /health");
    }

    let app = http::build_router(AppState {
        registry: registry.clone(),
        ingestor: ingestor.clone(),
        bridge,
        health_tracker,
        api_key: api_key.map(Arc::from),
    });

    let addr: SocketAddr = cfg
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid http.bind address {}", cfg.http.bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    info!("shutting down");
    // la session MQTT reste ouverte tant que les exécutions en cours publient
    let unfinished = registry.shutdown_and_wait(cfg.runtime.shutdown_grace()).await;
    if unfinished > 0 {
        warn!(unfinished, "jobs abandoned after shutdown grace period");
    }
    shutdown.cancel();

    // le listener possède l'émetteur du canal : sa fin déclenche le flush final
    if let Err(e) = listener_task.await {
        warn!(error = %e, "MQTT listener ended abnormally");
    }
    if let Err(e) = consumer.await {
        warn!(error = %e, "ingest consumer ended abnormally");
    }
    let _ = flush_timer.await;

    let stats = ingestor.stats();
    info!(
        flushed_batches = stats.flushed_batches,
        dropped_batches = stats.dropped_batches,
        "kernel stopped"
    );
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for Ctrl-C");
                token.cancelled().await;
                return;
            }
            info!("Ctrl-C received");
        }
        _ = token.cancelled() => {}
    }
}
