//! PUBLISHER - Remise des lectures canoniques au canal de messages
//!
//! La clé de routage est l'identifiant machine : chaque machine a son propre
//! topic (`<readings>/<machine_id>`) sur une seule session MQTT, ce qui garde
//! l'ordre par machine. Aucun ordre garanti entre machines.
//!
//! Politique d'échec : une publication ratée est signalée une fois puis
//! abandonnée (pas de retry, pas de dead-letter).

use crate::config::TopicsConf;
use crate::models::CanonicalReading;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish failed for machine {machine_id}: {reason}")]
    PublishFailed { machine_id: u64, reason: String },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    async fn publish(&self, reading: &CanonicalReading) -> Result<(), PublishError>;
}

/// Publication MQTT (QoS 1) sur le topic de la machine.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    topics: TopicsConf,
    timeout: Duration,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, topics: TopicsConf, timeout: Duration) -> Self {
        Self { client, topics, timeout }
    }
}

#[async_trait]
impl ReadingPublisher for MqttPublisher {
    async fn publish(&self, reading: &CanonicalReading) -> Result<(), PublishError> {
        let topic = self.topics.readings_for(reading.machine_id);
        let payload = serde_json::to_vec(reading)?;

        match timeout(self.timeout, self.client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload)).await {
            Ok(Ok(())) => {
                debug!(%topic, plan_id = reading.plan_id, "reading published");
                Ok(())
            }
            Ok(Err(e)) => Err(PublishError::PublishFailed {
                machine_id: reading.machine_id,
                reason: e.to_string(),
            }),
            Err(_) => Err(PublishError::PublishFailed {
                machine_id: reading.machine_id,
                reason: format!("send timed out after {:?}", self.timeout),
            }),
        }
    }
}

/// Canal en mémoire : une seule file FIFO, donc l'ordre par machine est trivialement conservé.
/// Sert de boucle locale publisher → ingestor sans broker.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<CanonicalReading>,
    timeout: Duration,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<CanonicalReading>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }
}

#[async_trait]
impl ReadingPublisher for ChannelPublisher {
    async fn publish(&self, reading: &CanonicalReading) -> Result<(), PublishError> {
        let failed = |reason: String| PublishError::PublishFailed {
            machine_id: reading.machine_id,
            reason,
        };
        match timeout(self.timeout, self.tx.send(reading.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(failed("channel closed".into())),
            Err(_) => Err(failed(format!("send timed out after {:?}", self.timeout))),
        }
    }
}
