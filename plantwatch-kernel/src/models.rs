use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type PlanId = u64;
pub type MachineId = u64;

/// Plan de collecte : un endpoint à interroger pour une machine, à intervalle fixe.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CollectionPlan {
    pub id: PlanId,
    pub machine_id: MachineId,
    pub interval_secs: u64,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl CollectionPlan {
    pub fn new(id: PlanId, machine_id: MachineId, interval_secs: u64, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            machine_id,
            interval_secs,
            endpoint: endpoint.into(),
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn http_method(&self) -> HttpMethod {
        HttpMethod::parse_lenient(self.method.as_deref())
    }
}

/// Verbes HTTP acceptés pour un endpoint de collecte. Tout le reste retombe sur GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
            Some("POST") => HttpMethod::Post,
            Some("PUT") => HttpMethod::Put,
            Some("PATCH") => HttpMethod::Patch,
            Some("DELETE") => HttpMethod::Delete,
            _ => HttpMethod::Get,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Lecture normalisée produite par une collecte réussie.
/// Les champs capteurs restent `None` quand la valeur source est absente ou illisible.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalReading {
    pub machine_id: MachineId,
    pub plan_id: PlanId,
    pub air_temperature: Option<f64>,
    pub process_temperature: Option<f64>,
    pub rotational_speed: Option<i64>,
    pub torque: Option<f64>,
    pub tool_wear: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_falls_back_to_get() {
        assert_eq!(HttpMethod::parse_lenient(None), HttpMethod::Get);
        assert_eq!(HttpMethod::parse_lenient(Some("")), HttpMethod::Get);
        assert_eq!(HttpMethod::parse_lenient(Some("FETCH")), HttpMethod::Get);
        assert_eq!(HttpMethod::parse_lenient(Some(" post ")), HttpMethod::Post);
        assert_eq!(HttpMethod::parse_lenient(Some("Delete")), HttpMethod::Delete);
    }

    #[test]
    fn plan_accepts_missing_method() {
        let plan: CollectionPlan = serde_json::from_str(
            r#"{"id":7,"machine_id":3,"interval_secs":5,"endpoint":"http://plc.local/data"}"#,
        )
        .unwrap();
        assert_eq!(plan.method, None);
        assert_eq!(plan.http_method(), HttpMethod::Get);
    }

    #[test]
    fn reading_uses_camel_case_on_the_wire() {
        let reading = CanonicalReading {
            machine_id: 1,
            plan_id: 2,
            air_temperature: Some(298.1),
            process_temperature: None,
            rotational_speed: Some(1551),
            torque: Some(42.8),
            tool_wear: None,
            collected_at: time::macros::datetime!(2025-11-18 10:30:00 UTC),
        };
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["machineId"], 1);
        assert_eq!(json["planId"], 2);
        assert_eq!(json["airTemperature"], 298.1);
        assert!(json["toolWear"].is_null());
        assert_eq!(json["collectedAt"], "2025-11-18T10:30:00Z");

        let back: CanonicalReading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }
}
