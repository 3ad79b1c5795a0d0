//! LIFECYCLE BRIDGE - Commandes de plan → opérations du registre
//!
//! RÔLE :
//! Reçoit les commandes `created` / `updated` / `deleted` (MQTT ou API REST)
//! et les applique au `JobRegistry`, de façon asynchrone pour l'émetteur.
//!
//! ORDRE :
//! Les commandes d'un même plan passent toujours par la même file (plan_id % shards),
//! traitée par un seul worker : l'ordre par plan est conservé. Aucun ordre entre plans.
//!
//! PERSISTANCE :
//! Au démarrage, les plans persistés sont relus et restaurés. En option, chaque
//! commande appliquée est recopiée dans le `PlanStore`.

use crate::models::{CollectionPlan, PlanId};
use crate::scheduler::{CreateOutcome, JobRegistry, RestoreReport, SharedJobRegistry};
use crate::store::{PlanStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const SHARD_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanCommand {
    Created { plan: CollectionPlan },
    Updated { plan: CollectionPlan },
    Deleted { plan_id: PlanId },
}

impl PlanCommand {
    pub fn plan_id(&self) -> PlanId {
        match self {
            PlanCommand::Created { plan } | PlanCommand::Updated { plan } => plan.id,
            PlanCommand::Deleted { plan_id } => *plan_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            PlanCommand::Created { .. } => "created",
            PlanCommand::Updated { .. } => "updated",
            PlanCommand::Deleted { .. } => "deleted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid command payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bridge is stopped")]
    Closed,
}

enum ShardMsg {
    Apply(PlanCommand),
    Sync(oneshot::Sender<()>),
}

pub struct LifecycleBridge {
    shards: Vec<mpsc::Sender<ShardMsg>>,
}

pub type SharedBridge = Arc<LifecycleBridge>;

impl LifecycleBridge {
    /// Démarre `shards` workers ordonnés. `mirror` reçoit une copie de chaque commande appliquée.
    pub fn start(registry: SharedJobRegistry, mirror: Option<Arc<dyn PlanStore>>, shards: usize) -> Self {
        let shards = shards.max(1);
        let senders = (0..shards)
            .map(|shard| {
                let (tx, rx) = mpsc::channel(SHARD_QUEUE_CAPACITY);
                tokio::spawn(run_shard(shard, rx, registry.clone(), mirror.clone()));
                tx
            })
            .collect();
        info!(shards, mirror = mirror.is_some(), "lifecycle bridge started");
        Self { shards: senders }
    }

    /// Met la commande en file ; elle sera appliquée après toutes les commandes déjà soumises pour ce plan.
    pub async fn submit(&self, command: PlanCommand) -> Result<(), BridgeError> {
        let shard = self.shard_for(command.plan_id());
        debug!(plan_id = command.plan_id(), action = command.action(), shard, "command queued");
        self.shards[shard]
            .send(ShardMsg::Apply(command))
            .await
            .map_err(|_| BridgeError::Closed)
    }

    pub async fn submit_json(&self, payload: &[u8]) -> Result<(), BridgeError> {
        let command: PlanCommand = serde_json::from_slice(payload)?;
        self.submit(command).await
    }

    /// Attend que toutes les commandes soumises avant l'appel soient appliquées.
    pub async fn sync(&self) -> Result<(), BridgeError> {
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard.send(ShardMsg::Sync(tx)).await.map_err(|_| BridgeError::Closed)?;
            acks.push(rx);
        }
        for ack in acks {
            ack.await.map_err(|_| BridgeError::Closed)?;
        }
        Ok(())
    }

    fn shard_for(&self, plan_id: PlanId) -> usize {
        (plan_id % self.shards.len() as u64) as usize
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<ShardMsg>,
    registry: SharedJobRegistry,
    mirror: Option<Arc<dyn PlanStore>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ShardMsg::Apply(command) => apply(&registry, mirror.as_deref(), command).await,
            ShardMsg::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(shard, "bridge shard stopped");
}

async fn apply(registry: &JobRegistry, mirror: Option<&dyn PlanStore>, command: PlanCommand) {
    let plan_id = command.plan_id();
    let action = command.action();

    // Some(plan) = à enregistrer, None = à retirer du store
    let persisted: Option<Option<CollectionPlan>> = match command {
        PlanCommand::Created { plan } => match registry.create_job(plan.clone()) {
            Ok(CreateOutcome::Scheduled) => Some(Some(plan)),
            Ok(CreateOutcome::AlreadyScheduled) => None,
            Err(e) => {
                error!(plan_id, error = %e, "create command rejected");
                None
            }
        },
        PlanCommand::Updated { plan } => match registry.update_job(plan.clone()) {
            Ok(()) => Some(Some(plan)),
            Err(e) => {
                // l'ancien job est déjà annulé : le store doit refléter l'absence de job
                error!(plan_id, error = %e, "update command rejected, previous job stopped");
                Some(None)
            }
        },
        PlanCommand::Deleted { plan_id } => {
            registry.remove_job(plan_id);
            Some(None)
        }
    };

    let (Some(store), Some(change)) = (mirror, persisted) else {
        return;
    };
    let result = match change {
        Some(plan) => store.upsert(&plan).await,
        None => store.remove(plan_id).await.map(|_| ()),
    };
    if let Err(e) = result {
        warn!(plan_id, action, error = %e, "failed to mirror command into plan store");
    }
}

/// Relit tous les plans persistés et recrée leurs jobs.
/// Les enregistrements écartés au chargement comptent comme des échecs.
pub async fn restore_plans(store: &dyn PlanStore, registry: &JobRegistry) -> Result<RestoreReport, StorageError> {
    let plans = store.load_all().await?;
    let mut report = registry.restore_all(&plans);
    let rejected = store.rejected_records();
    if rejected > 0 {
        warn!(rejected, "persisted plans skipped as unreadable");
        report.failed += rejected;
        report.total += rejected;
    }
    Ok(report)
}
