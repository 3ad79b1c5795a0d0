/*!
Builders pour données de test : lectures, corps de réponse machine, commandes de plan.
*/

use plantwatch_kernel::bridge::PlanCommand;
use plantwatch_kernel::models::{CanonicalReading, CollectionPlan, MachineId, PlanId};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct ReadingBuilder {
    reading: CanonicalReading,
}

impl ReadingBuilder {
    pub fn new(machine_id: MachineId, plan_id: PlanId) -> Self {
        Self {
            reading: CanonicalReading {
                machine_id,
                plan_id,
                air_temperature: None,
                process_temperature: None,
                rotational_speed: None,
                torque: None,
                tool_wear: None,
                collected_at: OffsetDateTime::UNIX_EPOCH,
            },
        }
    }

    pub fn air(mut self, value: f64) -> Self {
        self.reading.air_temperature = Some(value);
        self
    }

    pub fn process(mut self, value: f64) -> Self {
        self.reading.process_temperature = Some(value);
        self
    }

    pub fn speed(mut self, value: i64) -> Self {
        self.reading.rotational_speed = Some(value);
        self
    }

    pub fn torque(mut self, value: f64) -> Self {
        self.reading.torque = Some(value);
        self
    }

    pub fn wear(mut self, value: i64) -> Self {
        self.reading.tool_wear = Some(value);
        self
    }

    pub fn at(mut self, collected_at: OffsetDateTime) -> Self {
        self.reading.collected_at = collected_at;
        self
    }

    pub fn build(self) -> CanonicalReading {
        self.reading
    }
}

/// Corps JSON tel que renvoyé par un endpoint machine.
pub fn machine_body(
    air: Option<f64>,
    process: Option<f64>,
    speed: Option<i64>,
    torque: Option<f64>,
    wear: Option<i64>,
) -> Value {
    serde_json::json!({
        "airTemperature": air,
        "processTemperature": process,
        "rotationalSpeed": speed,
        "torque": torque,
        "toolWear": wear,
    })
}

pub fn created(plan: &CollectionPlan) -> PlanCommand {
    PlanCommand::Created { plan: plan.clone() }
}

pub fn updated(plan: &CollectionPlan) -> PlanCommand {
    PlanCommand::Updated { plan: plan.clone() }
}

pub fn deleted(plan_id: PlanId) -> PlanCommand {
    PlanCommand::Deleted { plan_id }
}

/// Payload MQTT / HTTP d'une commande.
pub fn command_payload(command: &PlanCommand) -> Vec<u8> {
    serde_json::to_vec(command).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_body_uses_endpoint_keys() {
        let body = machine_body(Some(298.1), None, Some(1551), Some(42.8), Some(0));
        assert_eq!(body["airTemperature"], 298.1);
        assert!(body["processTemperature"].is_null());
        assert_eq!(body["rotationalSpeed"], 1551);
        assert_eq!(body["toolWear"], 0);
    }

    #[test]
    fn command_payload_is_tagged() {
        let plan = CollectionPlan::new(3, 30, 10, "http://m30.local/data");
        let json: Value = serde_json::from_slice(&command_payload(&created(&plan))).unwrap();
        assert_eq!(json["action"], "created");
        assert_eq!(json["plan"]["machine_id"], 30);

        let json: Value = serde_json::from_slice(&command_payload(&deleted(3))).unwrap();
        assert_eq!(json, serde_json::json!({"action": "deleted", "plan_id": 3}));
    }
}
