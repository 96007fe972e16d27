//! Service call payload

use serde::{Deserialize, Serialize};

/// A service call observed on the hub
///
/// Listeners registered with a domain/service filter receive these when the
/// hub reports that a service was called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "light", "switch")
    pub domain: String,

    /// The service name (e.g., "turn_on", "toggle")
    pub service: String,

    /// Data passed to the service
    #[serde(default)]
    pub service_data: serde_json::Value,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
        }
    }

    /// Full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Entity ids targeted by the call, single string or array form
    pub fn entity_ids(&self) -> Vec<String> {
        match self.service_data.get("entity_id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_id() {
        let call = ServiceCall::new("light", "turn_on", json!({}));
        assert_eq!(call.service_id(), "light.turn_on");
    }

    #[test]
    fn test_entity_ids_forms() {
        let single = ServiceCall::new("light", "turn_on", json!({"entity_id": "light.tomas_rum"}));
        assert_eq!(single.entity_ids(), vec!["light.tomas_rum"]);

        let many = ServiceCall::new(
            "light",
            "turn_off",
            json!({"entity_id": ["light.kitchen", "light.hall"]}),
        );
        assert_eq!(many.entity_ids(), vec!["light.kitchen", "light.hall"]);

        let none = ServiceCall::new("homeassistant", "restart", json!(null));
        assert!(none.entity_ids().is_empty());
    }
}
