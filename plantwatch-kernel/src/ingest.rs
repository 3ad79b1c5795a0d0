//! BATCH INGESTOR - Bufferisation des lectures et écriture par lots
//!
//! RÔLE :
//! Consomme les lectures du canal de messages, les accumule, puis les remet au
//! store en un seul appel par lot.
//!
//! DÉCLENCHEURS :
//! - taille : l'ajout qui atteint `batch_size` (50) flushe avant de rendre la main
//! - temps  : un timer périodique (10s) flushe si le buffer n'est pas vide
//!
//! VERROUS :
//! - le verrou du buffer ne couvre que « push + test du seuil » et l'échange du buffer,
//!   jamais l'écriture vers le store
//! - une porte de flush sérialise les flush concurrents ; un flush qui trouve
//!   le buffer vide ne fait rien
//!
//! LIMITE ACCEPTÉE : si le store échoue, le lot est journalisé puis perdu
//! (pas de retry, pas de dead-letter). Au pire, une fenêtre de flush manque en base.

use crate::config::IngestConf;
use crate::models::CanonicalReading;
use crate::state::{new_shared, Shared};
use crate::store::ReadingStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
struct IngestCounters {
    received: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_readings: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_readings: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub buffered: usize,
    pub received: u64,
    pub flushed_batches: u64,
    pub flushed_readings: u64,
    pub dropped_batches: u64,
    pub dropped_readings: u64,
}

pub struct BatchIngestor {
    buffer: Shared<Vec<CanonicalReading>>,
    flush_gate: Mutex<()>,
    store: Arc<dyn ReadingStore>,
    batch_size: usize,
    flush_interval: Duration,
    counters: IngestCounters,
}

pub type SharedIngestor = Arc<BatchIngestor>;

impl BatchIngestor {
    pub fn new(store: Arc<dyn ReadingStore>, conf: &IngestConf) -> Self {
        Self::with_limits(store, conf.batch_size, conf.flush_interval())
    }

    pub fn with_limits(store: Arc<dyn ReadingStore>, batch_size: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: new_shared(Vec::with_capacity(batch_size)),
            flush_gate: Mutex::new(()),
            store,
            batch_size,
            flush_interval,
            counters: IngestCounters::default(),
        }
    }

    /// Ajoute une lecture ; si le seuil est atteint, le flush a lieu avant le retour.
    pub async fn append(&self, reading: CanonicalReading) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let reached = {
            let mut buffer = self.buffer.lock();
            buffer.push(reading);
            buffer.len() >= self.batch_size
        };
        if reached {
            debug!(batch_size = self.batch_size, "batch size reached");
            self.flush(FlushTrigger::Size).await;
        }
    }

    /// Échange le buffer contre un buffer vide et écrit le lot. Retourne le nombre de lectures écrites.
    pub async fn flush(&self, trigger: FlushTrigger) -> usize {
        let _gate = self.flush_gate.lock().await;
        let batch = std::mem::replace(&mut *self.buffer.lock(), Vec::with_capacity(self.batch_size));
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        match self.store.insert_batch(&batch).await {
            Ok(_) => {
                self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.flushed_readings.fetch_add(count as u64, Ordering::Relaxed);
                info!(count, trigger = trigger.as_str(), "batch flushed");
                count
            }
            Err(e) => {
                self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped_readings.fetch_add(count as u64, Ordering::Relaxed);
                error!(count, trigger = trigger.as_str(), error = %e, "batch flush failed, readings dropped");
                0
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            buffered: self.buffered(),
            received: self.counters.received.load(Ordering::Relaxed),
            flushed_batches: self.counters.flushed_batches.load(Ordering::Relaxed),
            flushed_readings: self.counters.flushed_readings.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            dropped_readings: self.counters.dropped_readings.load(Ordering::Relaxed),
        }
    }

    /// Timer de flush périodique, arrêté par `token`.
    pub fn spawn_flush_timer(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ingestor.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // le premier tick est immédiat
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if ingestor.buffered() > 0 {
                            ingestor.flush(FlushTrigger::Timer).await;
                        }
                    }
                }
            }
            debug!("flush timer stopped");
        })
    }

    /// Boucle de consommation : tourne jusqu'à fermeture du canal, puis flushe le reste.
    pub async fn consume(&self, rx: mpsc::Receiver<CanonicalReading>) {
        self.consume_until(rx, CancellationToken::new()).await;
    }

    /// Comme `consume`, mais s'arrête aussi sur `stop` : le canal est alors fermé,
    /// les lectures déjà en file sont vidées dans le buffer, puis flush final.
    pub async fn consume_until(&self, mut rx: mpsc::Receiver<CanonicalReading>, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                reading = rx.recv() => match reading {
                    Some(reading) => self.append(reading).await,
                    None => break,
                },
                _ = stop.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(reading) = rx.recv().await {
                        self.append(reading).await;
                        drained += 1;
                    }
                    debug!(drained, "reading channel drained after stop");
                    break;
                }
            }
        }
        info!(buffered = self.buffered(), "reading consumer stopping, final flush");
        self.flush(FlushTrigger::Shutdown).await;
    }
}
