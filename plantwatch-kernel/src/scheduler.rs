//! JOB REGISTRY - Un job de collecte périodique par plan actif
//!
//! RÔLE :
//! Possède la table plan_id → job vivant. Seul ce module crée, remplace ou
//! annule des jobs ; les jobs eux-mêmes ne touchent jamais à la table.
//!
//! FONCTIONNEMENT :
//! - chaque job = une tâche tokio (pas un thread) qui enchaîne collecte puis publication
//! - délai fixe : la prochaine exécution part `interval` après la FIN de la précédente,
//!   une collecte lente ne s'empile donc jamais sur elle-même
//! - annulation coopérative : le token n'est observé que pendant l'attente,
//!   une exécution en cours va jusqu'au bout (publication comprise)
//! - création en double = avertissement, pas d'erreur ; update = annuler puis recréer
//! - arrêt du process : `shutdown_and_wait` annule tout puis attend les exécutions
//!   en cours, dans la limite d'un délai de grâce

use crate::collector::{validate_endpoint, ReadingSource};
use crate::models::{CollectionPlan, PlanId};
use crate::publisher::ReadingPublisher;
use crate::state::{new_shared, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid plan {plan_id}: {reason}")]
    InvalidPlan { plan_id: PlanId, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Scheduled,
    AlreadyScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
pub struct JobStats {
    runs: AtomicU64,
    failures: AtomicU64,
}

impl JobStats {
    fn record_success(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Job vivant. Le token est l'unique poignée d'annulation.
struct ScheduledJob {
    plan: CollectionPlan,
    token: CancellationToken,
    handle: JoinHandle<()>,
    stats: Arc<JobStats>,
    created_at: OffsetDateTime,
}

impl ScheduledJob {
    fn view(&self) -> JobView {
        JobView {
            plan_id: self.plan.id,
            machine_id: self.plan.machine_id,
            interval_secs: self.plan.interval_secs,
            endpoint: self.plan.endpoint.clone(),
            method: self.plan.http_method().as_str(),
            runs: self.stats.runs.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

/// Vue sérialisable d'un job pour l'API d'administration.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub plan_id: PlanId,
    pub machine_id: u64,
    pub interval_secs: u64,
    pub endpoint: String,
    pub method: &'static str,
    pub runs: u64,
    pub failures: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct JobRegistry {
    jobs: Shared<HashMap<PlanId, ScheduledJob>>,
    source: Arc<dyn ReadingSource>,
    publisher: Arc<dyn ReadingPublisher>,
}

pub type SharedJobRegistry = Arc<JobRegistry>;

impl JobRegistry {
    pub fn new(source: Arc<dyn ReadingSource>, publisher: Arc<dyn ReadingPublisher>) -> Self {
        Self {
            jobs: new_shared(HashMap::new()),
            source,
            publisher,
        }
    }

    /// Planifie un job pour `plan`. Un job déjà présent pour cet id est laissé tel quel.
    pub fn create_job(&self, plan: CollectionPlan) -> Result<CreateOutcome, RegistryError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&plan.id) {
            warn!(plan_id = plan.id, "job already scheduled, ignoring create");
            return Ok(CreateOutcome::AlreadyScheduled);
        }
        let plan_id = plan.id;
        let job = self.spawn_job(plan)?;
        jobs.insert(plan_id, job);
        info!(plan_id, active = jobs.len(), "job scheduled");
        Ok(CreateOutcome::Scheduled)
    }

    /// Annule le job existant (s'il y en a un) puis en crée un nouveau avec les nouveaux paramètres.
    pub fn update_job(&self, plan: CollectionPlan) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock();
        match jobs.remove(&plan.id) {
            Some(old) => old.token.cancel(),
            None => debug!(plan_id = plan.id, "no job to replace, creating"),
        }
        let plan_id = plan.id;
        let job = self.spawn_job(plan)?;
        jobs.insert(plan_id, job);
        info!(plan_id, active = jobs.len(), "job rescheduled");
        Ok(())
    }

    /// Arrête les exécutions futures du job. Retourne `false` si aucun job n'existait.
    pub fn remove_job(&self, plan_id: PlanId) -> bool {
        let removed = self.jobs.lock().remove(&plan_id);
        match removed {
            Some(job) => {
                job.token.cancel();
                info!(plan_id, active = self.active_job_count(), "job removed");
                true
            }
            None => {
                warn!(plan_id, "no job to remove");
                false
            }
        }
    }

    /// Recrée un job par plan persisté ; un plan invalide n'empêche pas les suivants.
    pub fn restore_all(&self, plans: &[CollectionPlan]) -> RestoreReport {
        let mut report = RestoreReport {
            restored: 0,
            failed: 0,
            total: plans.len(),
        };
        if plans.is_empty() {
            info!("no persisted plans to restore");
            return report;
        }
        info!(total = plans.len(), "restoring persisted plans");

        for plan in plans {
            match self.create_job(plan.clone()) {
                Ok(_) => report.restored += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(plan_id = plan.id, error = %e, "failed to restore plan");
                }
            }
        }

        info!(
            restored = report.restored,
            failed = report.failed,
            total = report.total,
            "plan restore complete"
        );
        report
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn job(&self, plan_id: PlanId) -> Option<JobView> {
        self.jobs.lock().get(&plan_id).map(ScheduledJob::view)
    }

    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self.jobs.lock().values().map(ScheduledJob::view).collect();
        views.sort_by_key(|v| v.plan_id);
        views
    }

    /// Annule tous les jobs sans attendre les exécutions en cours.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock();
        for (_, job) in jobs.drain() {
            job.token.cancel();
        }
        info!("all jobs cancelled");
    }

    /// Annule tous les jobs puis attend la fin des exécutions en cours (publication
    /// comprise) jusqu'à `grace`. Retourne le nombre de jobs encore actifs à l'échéance.
    pub async fn shutdown_and_wait(&self, grace: Duration) -> usize {
        let drained: Vec<(PlanId, ScheduledJob)> = self.jobs.lock().drain().collect();
        for (_, job) in &drained {
            job.token.cancel();
        }
        info!(jobs = drained.len(), grace_secs = grace.as_secs(), "all jobs cancelled, waiting for in-flight runs");

        let deadline = tokio::time::Instant::now() + grace;
        let mut unfinished = 0;
        for (plan_id, job) in drained {
            match tokio::time::timeout_at(deadline, job.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(plan_id, error = %e, "job task ended abnormally"),
                Err(_) => {
                    unfinished += 1;
                    warn!(plan_id, "job still running after shutdown grace period");
                }
            }
        }
        unfinished
    }

    fn spawn_job(&self, plan: CollectionPlan) -> Result<ScheduledJob, RegistryError> {
        if plan.interval_secs == 0 {
            return Err(RegistryError::InvalidPlan {
                plan_id: plan.id,
                reason: "interval must be greater than zero".into(),
            });
        }
        if let Err(e) = validate_endpoint(&plan.endpoint) {
            return Err(RegistryError::InvalidPlan {
                plan_id: plan.id,
                reason: e.to_string(),
            });
        }

        let token = CancellationToken::new();
        let stats = Arc::new(JobStats::default());
        let handle = tokio::spawn(run_job(
            plan.clone(),
            self.source.clone(),
            self.publisher.clone(),
            token.clone(),
            stats.clone(),
        ));

        Ok(ScheduledJob {
            plan,
            token,
            handle,
            stats,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        for job in self.jobs.lock().values() {
            job.token.cancel();
        }
    }
}

async fn run_job(
    plan: CollectionPlan,
    source: Arc<dyn ReadingSource>,
    publisher: Arc<dyn ReadingPublisher>,
    token: CancellationToken,
    stats: Arc<JobStats>,
) {
    let interval = Duration::from_secs(plan.interval_secs);
    loop {
        if token.is_cancelled() {
            break;
        }
        execute_once(&plan, source.as_ref(), publisher.as_ref(), &stats).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(plan_id = plan.id, "job stopped");
}

async fn execute_once(
    plan: &CollectionPlan,
    source: &dyn ReadingSource,
    publisher: &dyn ReadingPublisher,
    stats: &JobStats,
) {
    debug!(plan_id = plan.id, machine_id = plan.machine_id, endpoint = %plan.endpoint, "collecting");

    let reading = match source.collect(plan).await {
        Ok(reading) => reading,
        Err(e) => {
            stats.record_failure();
            error!(plan_id = plan.id, machine_id = plan.machine_id, error = %e, "collection failed, waiting for next firing");
            return;
        }
    };

    match publisher.publish(&reading).await {
        Ok(()) => {
            stats.record_success();
            info!(plan_id = plan.id, machine_id = plan.machine_id, "reading collected and published");
        }
        Err(e) => {
            stats.record_failure();
            error!(plan_id = plan.id, machine_id = plan.machine_id, error = %e, "publish failed, reading dropped");
        }
    }
}
