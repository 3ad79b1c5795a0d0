use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tracing::{info, warn};

/// Configuration complète du kernel, lue depuis `plantwatch.yaml` (ou `PLANTWATCH_CONFIG`).
/// Chaque section a des valeurs par défaut : un fichier partiel est accepté.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub collector: CollectorConf,
    pub publisher: PublisherConf,
    pub ingest: IngestConf,
    pub bridge: BridgeConf,
    pub plans: PlansConf,
    pub storage: StorageConf,
    pub http: HttpConf,
    pub runtime: RuntimeConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "plantwatch-kernel".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConf {
    pub plan_commands: String,
    /// Préfixe des lectures ; la clé machine est ajoutée comme dernier niveau.
    pub readings: String,
    pub health: String,
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            plan_commands: "plantwatch/plans/command@v1".into(),
            readings: "plantwatch/readings@v1".into(),
            health: "plantwatch/kernel/health@v1".into(),
        }
    }
}

impl TopicsConf {
    pub fn readings_for(&self, machine_id: u64) -> String {
        format!("{}/{}", self.readings, machine_id)
    }

    pub fn readings_filter(&self) -> String {
        format!("{}/+", self.readings)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConf {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for CollectorConf {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 3,
            backoff_base_secs: 2,
            backoff_max_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherConf {
    pub timeout_secs: u64,
}

impl Default for PublisherConf {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConf {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for IngestConf {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_secs: 10,
            channel_capacity: 1024,
        }
    }
}

impl IngestConf {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConf {
    /// Nombre de files ordonnées ; un plan est toujours servi par la même file.
    pub shards: usize,
}

impl Default for BridgeConf {
    fn default() -> Self {
        Self { shards: 8 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PlansConf {
    pub path: String,
    pub mirror_commands: bool,
}

impl Default for PlansConf {
    fn default() -> Self {
        Self {
            path: "./data/plans.json".into(),
            mirror_commands: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub path: String,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            path: "./data/sensor_data.jsonl".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub health_publish_secs: u64,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            health_publish_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConf {
    pub worker_threads: usize,
    /// Attente max des exécutions en cours à l'arrêt.
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            shutdown_grace_secs: 30,
        }
    }
}

impl RuntimeConf {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub fn config_path() -> String {
    std::env::var("PLANTWATCH_CONFIG").unwrap_or_else(|_| "plantwatch.yaml".into())
}

/// Charge la config ; un fichier absent, vide ou invalide donne la config par défaut.
/// Lecture synchrone : le runtime tokio n'existe pas encore (sa taille en dépend).
pub fn load_config() -> KernelConfig {
    load_config_from(config_path())
}

pub fn load_config_from<P: AsRef<Path>>(path: P) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    match serde_yaml::from_str(&txt) {
        Ok(cfg) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            KernelConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ingest:\n  batch_size: 20\nmqtt:\n  host: broker.plant").unwrap();

        let cfg = load_config_from(file.path());
        assert_eq!(cfg.ingest.batch_size, 20);
        assert_eq!(cfg.ingest.flush_interval_secs, 10);
        assert_eq!(cfg.mqtt.host, "broker.plant");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.collector.max_retries, 3);
        assert_eq!(cfg.runtime.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_yaml_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ingest: [not, a, map").unwrap();

        let cfg = load_config_from(file.path());
        assert_eq!(cfg.ingest.batch_size, 50);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/nonexistent/plantwatch.yaml");
        assert_eq!(cfg.topics.plan_commands, "plantwatch/plans/command@v1");
    }

    #[test]
    fn reading_topics_carry_machine_key() {
        let topics = TopicsConf::default();
        assert_eq!(topics.readings_for(42), "plantwatch/readings@v1/42");
        assert_eq!(topics.readings_filter(), "plantwatch/readings@v1/+");
    }
}
