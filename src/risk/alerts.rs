//! Structured risk alerts.
//!
//! Alerts are emitted as JSON on the `risk_alert` tracing target so log
//! shippers and notification hooks can pick them up without parsing prose.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// Types of risk alerts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RiskAlertType {
    /// Portfolio loss limit breached; new entries halted
    CircuitBreakerTripped { reason: String },
    /// Operator cleared the breaker
    CircuitBreakerReset,
    /// A close keeps failing; retries continue
    PersistentCloseFailure { pair: String, attempts: u32 },
    /// Funding fell sharply tick-over-tick
    FundingDrop {
        pair: String,
        previous: Decimal,
        current: Decimal,
    },
    /// Perp and spot legs diverged
    HedgeDrift { pair: String, drift_pct: Decimal },
    /// Market data for a pair could not be used
    DataFailure { pair: String, error: String },
}

/// A unified risk alert.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub alert_type: RiskAlertType,
    pub severity: AlertSeverity,
    pub pair: Option<String>,
    pub message: String,
    pub metrics: BTreeMap<String, Decimal>,
}

impl RiskAlert {
    pub fn new(
        alert_type: RiskAlertType,
        severity: AlertSeverity,
        pair: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let alert_id = format!("risk-{}-{}", timestamp.timestamp(), Uuid::new_v4().simple());

        Self {
            alert_id,
            timestamp,
            alert_type,
            severity,
            pair,
            message,
            metrics: BTreeMap::new(),
        }
    }

    /// Add a metric to the alert.
    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Emit as structured log for workflow parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alert_serializes_tagged_type() {
        let alert = RiskAlert::new(
            RiskAlertType::PersistentCloseFailure {
                pair: "ETH".into(),
                attempts: 5,
            },
            AlertSeverity::Critical,
            Some("ETH".into()),
            "close failing".into(),
            Utc::now(),
        )
        .with_metric("attempts", dec!(5));

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alert_type"]["type"], "PersistentCloseFailure");
        assert_eq!(json["alert_type"]["attempts"], 5);
        assert_eq!(json["severity"], "Critical");
        assert!(alert.alert_id.starts_with("risk-"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
        assert_eq!(AlertSeverity::Error.as_str(), "ERROR");
    }
}
