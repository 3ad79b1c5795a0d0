//! COLLECTOR - Appel HTTP d'un endpoint machine et normalisation de la réponse
//!
//! RÔLE :
//! Une invocation = une requête (avec timeout), rejouée avec backoff exponentiel
//! en cas d'échec, puis convertie en `CanonicalReading`.
//!
//! FONCTIONNEMENT :
//! - timeout par tentative (10s par défaut)
//! - 3 tentatives supplémentaires max, délais 2s, 4s, 8s (plafond 10s)
//! - corps de réponse = objet JSON libre ; un champ absent ou illisible reste `None`
//! - seul l'épuisement des tentatives produit une erreur (`CollectionFailed`)

use crate::config::CollectorConf;
use crate::models::{CanonicalReading, CollectionPlan, HttpMethod, MachineId, PlanId};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("collection failed after {attempts} attempts: {last_error}")]
    CollectionFailed { attempts: u32, last_error: String },
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Erreur d'une seule tentative ; toujours rejouable.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("response body is not a JSON object")]
    NotAnObject,
}

/// Source de lectures pour un plan. Le registre de jobs ne connaît que ce trait.
#[async_trait]
pub trait ReadingSource: Send + Sync {
    async fn collect(&self, plan: &CollectionPlan) -> Result<CanonicalReading, CollectError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Tentatives supplémentaires après la première.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CollectorConf::default())
    }
}

impl From<&CollectorConf> for RetryPolicy {
    fn from(conf: &CollectorConf) -> Self {
        Self {
            max_retries: conf.max_retries,
            base_delay: Duration::from_secs(conf.backoff_base_secs),
            max_delay: Duration::from_secs(conf.backoff_max_secs),
        }
    }
}

impl RetryPolicy {
    /// Délai avant la relance numéro `attempt + 1` : base * 2^attempt, plafonné.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Exécute `operation` jusqu'au succès ou jusqu'à `policy.max_attempts()` essais.
/// `operation` reçoit le numéro de tentative (0 = premier appel).
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_retries => {
                return Err(RetryExhausted {
                    attempts: attempt + 1,
                    last_error: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    retry = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying collection"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub fn validate_endpoint(endpoint: &str) -> Result<reqwest::Url, CollectError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(CollectError::InvalidEndpoint(endpoint.to_string()));
    }
    let url = reqwest::Url::parse(trimmed)
        .map_err(|_| CollectError::InvalidEndpoint(endpoint.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(CollectError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Collecteur HTTP réel, partagé par tous les jobs (pool de connexions reqwest).
#[derive(Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    policy: RetryPolicy,
    timeout: Duration,
}

impl HttpCollector {
    pub fn new(conf: &CollectorConf) -> Result<Self, CollectError> {
        Self::with_policy(Duration::from_secs(conf.timeout_secs), RetryPolicy::from(conf))
    }

    pub fn with_policy(timeout: Duration, policy: RetryPolicy) -> Result<Self, CollectError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, policy, timeout })
    }

    pub async fn collect(
        &self,
        plan_id: PlanId,
        machine_id: MachineId,
        endpoint: &str,
        method: Option<&str>,
    ) -> Result<CanonicalReading, CollectError> {
        let url = validate_endpoint(endpoint)?;
        let method = HttpMethod::parse_lenient(method);
        debug!(plan_id, machine_id, %url, method = method.as_str(), "calling endpoint");

        let body = retry_with_backoff(&self.policy, |_| self.fetch_once(method, url.clone()))
            .await
            .map_err(|exhausted| {
                warn!(
                    plan_id,
                    machine_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "collection failed"
                );
                CollectError::CollectionFailed {
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error.to_string(),
                }
            })?;

        let reading = map_response(plan_id, machine_id, &body, OffsetDateTime::now_utc());
        info!(plan_id, machine_id, "collection succeeded");
        Ok(reading)
    }

    async fn fetch_once(&self, method: HttpMethod, url: reqwest::Url) -> Result<Map<String, Value>, AttemptError> {
        let response = self
            .client
            .request(method.into(), url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        match response.json::<Value>().await? {
            Value::Object(map) => Ok(map),
            _ => Err(AttemptError::NotAnObject),
        }
    }
}

#[async_trait]
impl ReadingSource for HttpCollector {
    async fn collect(&self, plan: &CollectionPlan) -> Result<CanonicalReading, CollectError> {
        HttpCollector::collect(self, plan.id, plan.machine_id, &plan.endpoint, plan.method.as_deref()).await
    }
}

/// Convertit le corps JSON brut en lecture canonique.
pub fn map_response(
    plan_id: PlanId,
    machine_id: MachineId,
    body: &Map<String, Value>,
    collected_at: OffsetDateTime,
) -> CanonicalReading {
    CanonicalReading {
        machine_id,
        plan_id,
        air_temperature: float_field(body, "airTemperature"),
        process_temperature: float_field(body, "processTemperature"),
        rotational_speed: int_field(body, "rotationalSpeed"),
        torque: float_field(body, "torque"),
        tool_wear: int_field(body, "toolWear"),
        collected_at,
    }
}

fn float_field(body: &Map<String, Value>, key: &str) -> Option<f64> {
    match body.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %s, "unparseable float field");
                None
            }
        },
        _ => None,
    }
}

fn int_field(body: &Map<String, Value>, key: &str) -> Option<i64> {
    match body.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %s, "unparseable integer field");
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn string_and_numeric_fields_are_mapped() {
        let body = object(json!({"airTemperature": "298.1", "torque": 42.8}));
        let reading = map_response(3, 9, &body, OffsetDateTime::UNIX_EPOCH);

        assert_eq!(reading.plan_id, 3);
        assert_eq!(reading.machine_id, 9);
        assert_eq!(reading.air_temperature, Some(298.1));
        assert_eq!(reading.torque, Some(42.8));
        assert_eq!(reading.tool_wear, None);
        assert_eq!(reading.process_temperature, None);
        assert_eq!(reading.rotational_speed, None);
    }

    #[test]
    fn unparseable_fields_become_absent() {
        let body = object(json!({
            "airTemperature": "n/a",
            "processTemperature": null,
            "rotationalSpeed": "1551",
            "toolWear": "12.5",
            "torque": [1, 2]
        }));
        let reading = map_response(1, 1, &body, OffsetDateTime::UNIX_EPOCH);

        assert_eq!(reading.air_temperature, None);
        assert_eq!(reading.process_temperature, None);
        assert_eq!(reading.rotational_speed, Some(1551));
        assert_eq!(reading.tool_wear, None);
        assert_eq!(reading.torque, None);
    }

    #[test]
    fn float_numbers_are_truncated_for_integer_fields() {
        let body = object(json!({"rotationalSpeed": 1551.9, "toolWear": 0}));
        let reading = map_response(1, 1, &body, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(reading.rotational_speed, Some(1551));
        assert_eq!(reading.tool_wear, Some(0));
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_growing_backoff() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = retry_with_backoff(&policy, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_four_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("timeout") }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(exhausted.last_error, "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn endpoint_validation() {
        assert!(validate_endpoint("http://10.0.0.5:8000/sensor").is_ok());
        assert!(validate_endpoint("https://plc.local/api").is_ok());
        assert!(matches!(validate_endpoint(""), Err(CollectError::InvalidEndpoint(_))));
        assert!(matches!(validate_endpoint("   "), Err(CollectError::InvalidEndpoint(_))));
        assert!(matches!(validate_endpoint("not a url"), Err(CollectError::InvalidEndpoint(_))));
        assert!(matches!(validate_endpoint("ftp://plc.local/x"), Err(CollectError::InvalidEndpoint(_))));
    }
}
