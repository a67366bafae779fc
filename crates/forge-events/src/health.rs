//! Health report returned by [`EventBusClient::health_check`](crate::EventBusClient::health_check).

use serde::{Deserialize, Serialize};

/// Connectivity of the client's bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected and the backend answered the probe.
    Connected,
    /// No bus is connected.
    Disconnected,
    /// Connected but the probe failed.
    Error,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,

    /// Backend name when a bus is connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,

    /// Probe failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub(crate) fn connected(implementation: &str) -> Self {
        Self {
            status: HealthStatus::Connected,
            implementation: Some(implementation.to_string()),
            error: None,
        }
    }

    pub(crate) fn disconnected() -> Self {
        Self {
            status: HealthStatus::Disconnected,
            implementation: None,
            error: None,
        }
    }

    pub(crate) fn error(implementation: &str, error: impl ToString) -> Self {
        Self {
            status: HealthStatus::Error,
            implementation: Some(implementation.to_string()),
            error: Some(error.to_string()),
        }
    }

    /// Whether the status is [`HealthStatus::Connected`].
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disconnected_serializes_status_only() {
        let value = serde_json::to_value(HealthReport::disconnected()).unwrap();
        assert_eq!(value, json!({"status": "disconnected"}));
    }

    #[test]
    fn test_error_report_shape() {
        let report = HealthReport::error("kafka", "broker down");
        assert!(!report.is_healthy());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"status": "error", "implementation": "kafka", "error": "broker down"})
        );
    }

    #[test]
    fn test_connected_is_healthy() {
        let report = HealthReport::connected("memory");
        assert!(report.is_healthy());
        assert_eq!(report.implementation.as_deref(), Some("memory"));
    }
}
