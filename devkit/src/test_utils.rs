/*!
Harness de test du pipeline complet

Assemble sans broker ni base : source scriptée → registre de jobs → publisher
canal → ingestor → store mémoire, avec le bridge de commandes devant le registre.
*/

use crate::doubles::{MemoryReadingStore, ScriptedSource};
use plantwatch_kernel::bridge::{LifecycleBridge, SharedBridge};
use plantwatch_kernel::ingest::{BatchIngestor, IngestStats, SharedIngestor};
use plantwatch_kernel::publisher::ChannelPublisher;
use plantwatch_kernel::scheduler::{JobRegistry, SharedJobRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CHANNEL_CAPACITY: usize = 256;
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Logs visibles dans la sortie de test ; plusieurs appels sont sans effet.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantwatch_kernel=debug")))
        .try_init();
}

/// Sonde `condition` toutes les 10ms (horloge tokio) jusqu'à `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct PipelineHarness {
    pub source: Arc<ScriptedSource>,
    pub store: Arc<MemoryReadingStore>,
    pub registry: SharedJobRegistry,
    pub ingestor: SharedIngestor,
    pub bridge: SharedBridge,
    token: CancellationToken,
    consumer: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl PipelineHarness {
    pub fn start(batch_size: usize, flush_interval: Duration) -> Self {
        init_test_tracing();

        let source = Arc::new(ScriptedSource::new());
        let store = Arc::new(MemoryReadingStore::new());
        let ingestor = Arc::new(BatchIngestor::with_limits(store.clone(), batch_size, flush_interval));

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let publisher = Arc::new(ChannelPublisher::new(tx, Duration::from_secs(5)));
        let registry = Arc::new(JobRegistry::new(source.clone(), publisher));
        let bridge = Arc::new(LifecycleBridge::start(registry.clone(), None, 4));

        let token = CancellationToken::new();
        let timer = ingestor.spawn_flush_timer(token.clone());
        let consumer = {
            let ingestor = ingestor.clone();
            let stop = token.clone();
            tokio::spawn(async move { ingestor.consume_until(rx, stop).await })
        };

        Self {
            source,
            store,
            registry,
            ingestor,
            bridge,
            token,
            consumer,
            timer,
        }
    }

    /// Arrête les jobs en laissant finir les exécutions en cours, puis le timer et
    /// le consommateur ; ce dernier vide le canal et flushe avant de rendre la main.
    pub async fn stop(self) -> IngestStats {
        self.registry.shutdown_and_wait(STOP_GRACE).await;
        self.token.cancel();
        let _ = self.timer.await;
        let _ = self.consumer.await;
        self.ingestor.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_until_times_out_on_false_condition() {
        assert!(!wait_until(Duration::from_secs(1), || false).await);
        assert!(wait_until(Duration::from_secs(1), || true).await);
    }
}
