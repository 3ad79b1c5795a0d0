/*!
Doublures des collaborateurs du kernel : publisher, store de lectures, source de lectures.

Chaque doublure enregistre ce qu'elle reçoit et peut être basculée en mode panne.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use plantwatch_kernel::collector::{CollectError, ReadingSource};
use plantwatch_kernel::models::{CanonicalReading, CollectionPlan, MachineId, PlanId};
use plantwatch_kernel::publisher::{PublishError, ReadingPublisher};
use plantwatch_kernel::store::{ReadingStore, StorageError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// Publisher qui garde chaque lecture publiée, dans l'ordre.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<CanonicalReading>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<CanonicalReading> {
        self.published.lock().clone()
    }

    pub fn for_machine(&self, machine_id: MachineId) -> Vec<CanonicalReading> {
        self.published
            .lock()
            .iter()
            .filter(|r| r.machine_id == machine_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl ReadingPublisher for RecordingPublisher {
    async fn publish(&self, reading: &CanonicalReading) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::PublishFailed {
                machine_id: reading.machine_id,
                reason: "channel unavailable".into(),
            });
        }
        self.published.lock().push(reading.clone());
        Ok(())
    }
}

/// Store de lectures en mémoire : un élément par appel `insert_batch`.
#[derive(Default)]
pub struct MemoryReadingStore {
    batches: Mutex<Vec<Vec<CanonicalReading>>>,
    failing: AtomicBool,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<CanonicalReading>> {
        self.batches.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    pub fn all_readings(&self) -> Vec<CanonicalReading> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn insert_batch(&self, readings: &[CanonicalReading]) -> Result<usize, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("database unavailable")));
        }
        self.batches.lock().push(readings.to_vec());
        Ok(readings.len())
    }
}

#[derive(Debug, Clone)]
enum Step {
    Fail(String),
    Delay(Duration),
}

/// Source de lectures sans réseau. Les étapes scriptées sont consommées dans l'ordre,
/// ensuite chaque appel réussit avec une lecture dérivée du plan.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(PlanId, tokio::time::Instant)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les `n` prochains appels échouent.
    pub fn fail_next(&self, n: usize) -> &Self {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Step::Fail("endpoint unreachable".into()));
        }
        self
    }

    /// Le prochain appel réussit après `delay`.
    pub fn slow_next(&self, delay: Duration) -> &Self {
        self.script.lock().push_back(Step::Delay(delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, plan_id: PlanId) -> Vec<tokio::time::Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == plan_id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl ReadingSource for ScriptedSource {
    async fn collect(&self, plan: &CollectionPlan) -> Result<CanonicalReading, CollectError> {
        self.calls.lock().push((plan.id, tokio::time::Instant::now()));
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Fail(reason)) => {
                return Err(CollectError::CollectionFailed {
                    attempts: 1,
                    last_error: reason,
                })
            }
            Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        Ok(CanonicalReading {
            machine_id: plan.machine_id,
            plan_id: plan.id,
            air_temperature: Some(298.0 + plan.machine_id as f64 / 10.0),
            process_temperature: Some(308.5),
            rotational_speed: Some(1500),
            torque: Some(40.0),
            tool_wear: Some(plan.id as i64),
            collected_at: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> CollectionPlan {
        CollectionPlan::new(1, 7, 5, "http://m7.local/data")
    }

    #[tokio::test]
    async fn scripted_source_follows_script_then_succeeds() {
        let source = ScriptedSource::new();
        source.fail_next(2);

        assert!(source.collect(&plan()).await.is_err());
        assert!(source.collect(&plan()).await.is_err());
        let reading = source.collect(&plan()).await.unwrap();
        assert_eq!(reading.machine_id, 7);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn failing_doubles_report_errors() {
        let publisher = RecordingPublisher::new();
        let reading = ScriptedSource::new().collect(&plan()).await.unwrap();

        publisher.publish(&reading).await.unwrap();
        publisher.set_failing(true);
        assert!(publisher.publish(&reading).await.is_err());
        assert_eq!(publisher.for_machine(7).len(), 1);

        let store = MemoryReadingStore::new();
        store.set_failing(true);
        assert!(store.insert_batch(&[reading.clone()]).await.is_err());
        store.set_failing(false);
        assert_eq!(store.insert_batch(&[reading]).await.unwrap(), 1);
        assert_eq!(store.batch_sizes(), vec![1]);
    }
}
