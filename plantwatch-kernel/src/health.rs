//! HEALTH - État du kernel exposé sur `/system/health` et publié sur MQTT

use crate::ingest::BatchIngestor;
use crate::scheduler::JobRegistry;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub active_jobs: usize,
    pub buffered_readings: usize,
    pub readings_received: u64,
    /// Lectures MQTT refusées faute de place dans le canal d'ingestion.
    pub readings_dropped: u64,
    pub flushed_batches: u64,
    pub flushed_readings: u64,
    pub dropped_batches: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
    readings_dropped: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
            readings_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn record_reading_drop(&self) {
        self.readings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn readings_dropped(&self) -> u64 {
        self.readings_dropped.load(Ordering::Relaxed)
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, registry: &JobRegistry, ingestor: &BatchIngestor) -> KernelHealth {
        let ingest = ingestor.stats();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            active_jobs: registry.active_job_count(),
            buffered_readings: ingest.buffered,
            readings_received: ingest.received,
            readings_dropped: self.readings_dropped(),
            flushed_batches: ingest.flushed_batches,
            flushed_readings: ingest.flushed_readings,
            dropped_batches: ingest.dropped_batches,
        }
    }

    /// Publie périodiquement l'état du kernel sur `topic` via la session MQTT partagée.
    pub fn spawn_health_publisher(
        &self,
        client: AsyncClient,
        topic: String,
        period: Duration,
        registry: Arc<JobRegistry>,
        ingestor: Arc<BatchIngestor>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let health = tracker.get_health(&registry, &ingestor);
                        let payload = match serde_json::to_vec(&health) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "failed to encode health");
                                continue;
                            }
                        };
                        match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                            Ok(()) => debug!(
                                uptime = health.uptime_seconds,
                                jobs = health.active_jobs,
                                buffered = health.buffered_readings,
                                "kernel health published"
                            ),
                            Err(e) => warn!(error = %e, "failed to publish health"),
                        }
                    }
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
