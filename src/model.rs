//! Request shapes and payload validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The downstream compute services a payload item can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Revenue,
    Rebates,
    Specialty,
}

impl ServiceName {
    /// All services, in dispatch order.
    pub const ALL: [ServiceName; 3] = [
        ServiceName::Revenue,
        ServiceName::Rebates,
        ServiceName::Specialty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Revenue => "revenue",
            ServiceName::Rebates => "rebates",
            ServiceName::Specialty => "specialty",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revenue" => Ok(ServiceName::Revenue),
            "rebates" => Ok(ServiceName::Rebates),
            "specialty" => Ok(ServiceName::Specialty),
            other => Err(format!("unknown service name: {other}")),
        }
    }
}

/// Error for requests that are structurally valid JSON but violate the
/// payload rules. Never dispatched; recorded against the task instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload must contain at least one item")]
    EmptyPayload,

    #[error("payload item {index} must carry at least one of revenue, rebates or specialty")]
    EmptyItem { index: usize },
}

/// One item of an orchestration payload. Each present field is an opaque
/// JSON object forwarded to the matching service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebates: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<serde_json::Value>,
}

impl PayloadItem {
    /// The sub-item for a given service, if present.
    pub fn get(&self, service: ServiceName) -> Option<&serde_json::Value> {
        match service {
            ServiceName::Revenue => self.revenue.as_ref(),
            ServiceName::Rebates => self.rebates.as_ref(),
            ServiceName::Specialty => self.specialty.as_ref(),
        }
    }

    /// True when no service sub-item is present.
    pub fn is_empty(&self) -> bool {
        self.revenue.is_none() && self.rebates.is_none() && self.specialty.is_none()
    }
}

/// An orchestration request as accepted by both entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,

    pub payload: Vec<PayloadItem>,
}

/// Check the payload rules: non-empty, and every item targets at least one
/// service.
pub fn validate_payload(items: &[PayloadItem]) -> Result<(), ValidationError> {
    if items.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    for (index, item) in items.iter().enumerate() {
        if item.is_empty() {
            return Err(ValidationError::EmptyItem { index });
        }
    }
    Ok(())
}

/// Best-effort correlation ids for a service: read `scenario_id` and
/// `business_type_id` from the first item carrying that service.
pub fn correlation_ids(
    items: &[PayloadItem],
    service: ServiceName,
) -> (Option<String>, Option<String>) {
    let first = items.iter().find_map(|item| item.get(service));
    let field = |name: &str| {
        first
            .and_then(|value| value.get(name))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    };
    (field("scenario_id"), field("business_type_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(revenue: bool, rebates: bool, specialty: bool) -> PayloadItem {
        PayloadItem {
            revenue: revenue.then(|| json!({"scenario_id": "s1", "business_type_id": "b1"})),
            rebates: rebates.then(|| json!({"amount": 5})),
            specialty: specialty.then(|| json!({"region": "US"})),
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert_eq!(validate_payload(&[]), Err(ValidationError::EmptyPayload));
    }

    #[test]
    fn test_empty_item_rejected_with_index() {
        let items = vec![item(true, false, false), item(false, false, false)];
        assert_eq!(
            validate_payload(&items),
            Err(ValidationError::EmptyItem { index: 1 })
        );
    }

    #[test]
    fn test_single_service_item_accepted() {
        assert!(validate_payload(&[item(false, true, false)]).is_ok());
    }

    #[test]
    fn test_correlation_ids_from_first_matching_item() {
        let items = vec![item(false, true, false), item(true, false, false)];
        let (scenario, business) = correlation_ids(&items, ServiceName::Revenue);
        assert_eq!(scenario.as_deref(), Some("s1"));
        assert_eq!(business.as_deref(), Some("b1"));

        // Rebates sub-items carry neither id.
        let (scenario, business) = correlation_ids(&items, ServiceName::Rebates);
        assert_eq!(scenario, None);
        assert_eq!(business, None);
    }

    #[test]
    fn test_service_name_round_trip() {
        for service in ServiceName::ALL {
            assert_eq!(service.as_str().parse::<ServiceName>(), Ok(service));
        }
    }
}
