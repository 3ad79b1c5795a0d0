//! MQTT - Session unique du kernel et routage des messages entrants
//!
//! - topic de commandes            → bridge (création / mise à jour / suppression de plans)
//! - `<readings>/<machine_id>`     → canal de l'ingestor
//!
//! La boucle ne s'arrête jamais sur un consommateur lent : les commandes passent
//! par une file vers une tâche dédiée, les lectures sont refusées si le canal est plein.
//!
//! Les abonnements sont refaits à chaque CONNACK (session non persistante).

use crate::bridge::{PlanCommand, SharedBridge};
use crate::config::{MqttConf, TopicsConf};
use crate::health::HealthTracker;
use crate::models::CanonicalReading;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const ERROR_BACKOFF: Duration = Duration::from_secs(2);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(conf.client_id.as_str(), conf.host.as_str(), conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(5)));
    AsyncClient::new(opts, REQUEST_CAPACITY)
}

#[derive(Debug, PartialEq)]
pub enum Inbound {
    Command(PlanCommand),
    Reading(CanonicalReading),
    Ignored,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid payload on {topic}: {source}")]
pub struct RouteError {
    topic: String,
    #[source]
    source: serde_json::Error,
}

/// Décode un message selon son topic.
pub fn route_publish(topics: &TopicsConf, topic: &str, payload: &[u8]) -> Result<Inbound, RouteError> {
    let decode_err = |source| RouteError {
        topic: topic.to_string(),
        source,
    };

    if topic == topics.plan_commands {
        return serde_json::from_slice(payload).map(Inbound::Command).map_err(decode_err);
    }

    let Some(key) = topic
        .strip_prefix(topics.readings.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return Ok(Inbound::Ignored);
    };

    let reading: CanonicalReading = serde_json::from_slice(payload).map_err(decode_err)?;
    if key.parse::<u64>().ok() != Some(reading.machine_id) {
        warn!(topic, machine_id = reading.machine_id, "reading routed under another machine key");
    }
    Ok(Inbound::Reading(reading))
}

fn subscribe_all(client: &AsyncClient, topics: &TopicsConf) {
    for filter in [topics.plan_commands.clone(), topics.readings_filter()] {
        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %filter, "subscribed"),
            Err(e) => error!(topic = %filter, error = %e, "MQTT subscribe failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    Dropped,
    Ignored,
}

/// Remet un message décodé à son consommateur sans jamais suspendre la boucle MQTT.
/// Canal d'ingestion plein ou fermé : la lecture est perdue et comptée.
pub fn dispatch(
    inbound: Inbound,
    commands: &mpsc::UnboundedSender<PlanCommand>,
    readings: &mpsc::Sender<CanonicalReading>,
    health: &HealthTracker,
) -> Dispatch {
    match inbound {
        Inbound::Command(command) => match commands.send(command) {
            Ok(()) => Dispatch::Queued,
            Err(e) => {
                error!(plan_id = e.0.plan_id(), "command forwarder stopped, command dropped");
                Dispatch::Dropped
            }
        },
        Inbound::Reading(reading) => match readings.try_send(reading) {
            Ok(()) => Dispatch::Queued,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                health.record_reading_drop();
                warn!(machine_id = reading.machine_id, "ingest channel full, reading dropped");
                Dispatch::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(reading)) => {
                health.record_reading_drop();
                warn!(machine_id = reading.machine_id, "ingest channel closed, reading dropped");
                Dispatch::Dropped
            }
        },
        Inbound::Ignored => Dispatch::Ignored,
    }
}

/// Transmet les commandes au bridge dans leur ordre d'arrivée ; s'arrête quand
/// l'émetteur est fermé.
pub fn spawn_command_forwarder(bridge: SharedBridge, mut rx: mpsc::UnboundedReceiver<PlanCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if let Err(e) = bridge.submit(command).await {
                error!(error = %e, "failed to hand command to bridge");
            }
        }
        debug!("command forwarder stopped");
    })
}

fn handle_publish(
    topics: &TopicsConf,
    publish: &Publish,
    commands: &mpsc::UnboundedSender<PlanCommand>,
    readings: &mpsc::Sender<CanonicalReading>,
    health: &HealthTracker,
) {
    match route_publish(topics, &publish.topic, &publish.payload) {
        Ok(inbound) => {
            if dispatch(inbound, commands, readings, health) == Dispatch::Ignored {
                debug!(topic = %publish.topic, "message ignored");
            }
        }
        Err(e) => warn!(error = %e, "dropping MQTT message"),
    }
}

/// Boucle de la session MQTT : suit l'état de connexion et dispatche les messages.
/// À l'annulation, la boucle continue d'être pollée jusqu'à l'envoi du DISCONNECT,
/// ce qui laisse partir les publications encore en file.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: TopicsConf,
    bridge: SharedBridge,
    readings: mpsc::Sender<CanonicalReading>,
    health: HealthTracker,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let forwarder = spawn_command_forwarder(bridge, commands_rx);

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    health.mark_mqtt_connected();
                    subscribe_all(&client, &topics);
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    handle_publish(&topics, &p, &commands, &readings, &health);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        match client.try_disconnect() {
            Ok(()) => {
                let flush = async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                            Ok(Event::Incoming(Incoming::Publish(p))) => {
                                handle_publish(&topics, &p, &commands, &readings, &health);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(error = %e, "MQTT session closed before disconnect");
                                break;
                            }
                        }
                    }
                };
                if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
                    warn!("MQTT disconnect timed out, pending publications may be lost");
                }
            }
            Err(e) => debug!(error = %e, "MQTT disconnect request not sent"),
        }
        health.mark_mqtt_disconnected();

        drop(commands);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "command forwarder ended abnormally");
        }
        info!("MQTT listener stopped");
    })
}
