//! STORES - Collaborateurs de persistance du pipeline
//!
//! - `ReadingStore` : insertion par lot des lectures (appelé une fois par flush)
//! - `PlanStore`    : plans persistés, relus au démarrage pour restaurer les jobs
//!
//! Implémentations par défaut sur fichiers (JSON lines pour les lectures,
//! tableau JSON pour les plans). Une base SQL se branche derrière les mêmes traits.

use crate::models::{CanonicalReading, CollectionPlan, PlanId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Insère tout le lot en un appel. Un lot vide ou d'un seul élément est valide.
    async fn insert_batch(&self, readings: &[CanonicalReading]) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<CollectionPlan>, StorageError>;
    async fn upsert(&self, plan: &CollectionPlan) -> Result<(), StorageError>;
    async fn remove(&self, plan_id: PlanId) -> Result<bool, StorageError>;

    /// Enregistrements persistés illisibles, écartés au chargement.
    fn rejected_records(&self) -> usize {
        0
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Lectures ajoutées en fin de fichier, une ligne JSON par lecture.
pub struct JsonlReadingStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlReadingStore {
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let path = path.into();
        ensure_parent(&path).await?;
        info!(path = %path.display(), "reading store ready");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReadingStore for JsonlReadingStore {
    async fn insert_batch(&self, readings: &[CanonicalReading]) -> Result<usize, StorageError> {
        if readings.is_empty() {
            return Ok(0);
        }
        let mut lines = String::new();
        for reading in readings {
            lines.push_str(&serde_json::to_string(reading)?);
            lines.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;

        debug!(count = readings.len(), path = %self.path.display(), "batch written");
        Ok(readings.len())
    }
}

/// Plans gardés en mémoire et réécrits en entier à chaque modification.
pub struct JsonPlanStore {
    path: PathBuf,
    plans: RwLock<BTreeMap<PlanId, CollectionPlan>>,
    rejected: usize,
}

impl JsonPlanStore {
    /// Ouvre le fichier de plans ; un fichier absent donne un store vide.
    /// Chaque enregistrement est décodé séparément : un plan illisible est écarté
    /// (et compté), les autres sont gardés. Un fichier illisible dans son ensemble
    /// donne un store vide.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let path = path.into();
        if !fs::try_exists(&path).await? {
            info!(path = %path.display(), "no existing plans file, starting fresh");
            return Ok(Self::empty(path));
        }

        let content = fs::read_to_string(&path).await?;
        if content.trim().is_empty() {
            return Ok(Self::empty(path));
        }

        let records: Vec<Value> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                error!(path = %path.display(), error = %e, "plans file unreadable, starting with no plans");
                return Ok(Self::empty(path));
            }
        };

        let mut plans = BTreeMap::new();
        let mut rejected = 0;
        for (index, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<CollectionPlan>(record) {
                Ok(plan) => {
                    plans.insert(plan.id, plan);
                }
                Err(e) => {
                    rejected += 1;
                    warn!(path = %path.display(), index, error = %e, "skipping malformed plan record");
                }
            }
        }
        info!(count = plans.len(), rejected, path = %path.display(), "plans loaded");

        Ok(Self {
            path,
            plans: RwLock::new(plans),
            rejected,
        })
    }

    /// Store sans plan ; le fichier n'est écrit qu'à la première modification.
    pub fn empty<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            plans: RwLock::new(BTreeMap::new()),
            rejected: 0,
        }
    }

    async fn save(&self, plans: &BTreeMap<PlanId, CollectionPlan>) -> Result<(), StorageError> {
        ensure_parent(&self.path).await?;
        let list: Vec<&CollectionPlan> = plans.values().collect();
        let content = serde_json::to_string_pretty(&list)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl PlanStore for JsonPlanStore {
    async fn load_all(&self) -> Result<Vec<CollectionPlan>, StorageError> {
        Ok(self.plans.read().await.values().cloned().collect())
    }

    async fn upsert(&self, plan: &CollectionPlan) -> Result<(), StorageError> {
        let mut plans = self.plans.write().await;
        plans.insert(plan.id, plan.clone());
        self.save(&plans).await
    }

    async fn remove(&self, plan_id: PlanId) -> Result<bool, StorageError> {
        let mut plans = self.plans.write().await;
        if plans.remove(&plan_id).is_none() {
            return Ok(false);
        }
        self.save(&plans).await?;
        Ok(true)
    }

    fn rejected_records(&self) -> usize {
        self.rejected
    }
}
