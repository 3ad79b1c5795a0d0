//! Restauration des plans persistés et miroir des commandes vers le store de plans.

use plantwatch_devkit::builders::{command_payload, created, deleted};
use plantwatch_devkit::{init_test_tracing, RecordingPublisher, ScriptedSource};
use plantwatch_kernel::bridge::{restore_plans, LifecycleBridge};
use plantwatch_kernel::config::TopicsConf;
use plantwatch_kernel::models::CollectionPlan;
use plantwatch_kernel::health::HealthTracker;
use plantwatch_kernel::mqtt::{dispatch, route_publish, spawn_command_forwarder, Dispatch};
use plantwatch_kernel::scheduler::{JobRegistry, RestoreReport};
use plantwatch_kernel::store::{JsonPlanStore, PlanStore};
use std::sync::Arc;
use tokio::sync::mpsc;

fn registry() -> Arc<JobRegistry> {
    Arc::new(JobRegistry::new(
        Arc::new(ScriptedSource::new()),
        Arc::new(RecordingPublisher::new()),
    ))
}

fn plan(id: u64) -> CollectionPlan {
    CollectionPlan::new(id, id, 60, format!("http://machine-{id}.local/data"))
}

async fn seeded_store(path: &std::path::Path) -> JsonPlanStore {
    let store = JsonPlanStore::open(path).await.unwrap();
    for id in 1..=5 {
        let mut p = plan(id);
        if id == 3 {
            p.interval_secs = 0;
        }
        store.upsert(&p).await.unwrap();
    }
    store
}

#[tokio::test]
async fn invalid_persisted_plan_does_not_block_the_others() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir.path().join("plans.json")).await;
    let registry = registry();

    let report = restore_plans(&store, &registry).await.unwrap();

    assert_eq!(report, RestoreReport { restored: 4, failed: 1, total: 5 });
    assert_eq!(registry.active_job_count(), 4);
    assert!(registry.job(3).is_none());
    registry.shutdown();
}

#[tokio::test]
async fn mirrored_commands_shape_the_next_restore() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plans.json");
    let store: Arc<dyn PlanStore> = Arc::new(seeded_store(&path).await);

    let first = registry();
    restore_plans(store.as_ref(), &first).await.unwrap();
    let bridge = LifecycleBridge::start(first.clone(), Some(store.clone()), 4);
    bridge.submit(deleted(1)).await.unwrap();
    bridge.submit(created(&plan(6))).await.unwrap();
    bridge.sync().await.unwrap();
    assert_eq!(first.active_job_count(), 4);
    first.shutdown();

    let reopened = JsonPlanStore::open(&path).await.unwrap();
    let second = registry();
    let report = restore_plans(&reopened, &second).await.unwrap();

    assert_eq!(report, RestoreReport { restored: 4, failed: 1, total: 5 });
    let ids: Vec<u64> = second.list_jobs().iter().map(|j| j.plan_id).collect();
    assert_eq!(ids, vec![2, 4, 5, 6]);
    second.shutdown();
}

#[tokio::test]
async fn command_received_on_mqtt_topic_reaches_registry() {
    let registry = registry();
    let bridge = Arc::new(LifecycleBridge::start(registry.clone(), None, 2));
    let topics = TopicsConf::default();
    let health = HealthTracker::new();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (readings, _readings_rx) = mpsc::channel(1);
    let forwarder = spawn_command_forwarder(bridge.clone(), commands_rx);

    let payload = command_payload(&created(&plan(9)));
    let inbound = route_publish(&topics, &topics.plan_commands, &payload).unwrap();
    assert_eq!(dispatch(inbound, &commands, &readings, &health), Dispatch::Queued);
    drop(commands);
    forwarder.await.unwrap();
    bridge.sync().await.unwrap();

    assert_eq!(registry.job(9).unwrap().machine_id, 9);
    registry.shutdown();
}
