//! Schedule configuration for cron and event triggers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::errors::{SwarmError, SwarmResult};

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

/// Trigger configuration for one workflow.
///
/// Exactly one of `cron_expr` (seconds-precision cron) or `event_type` must
/// be set. `max_concurrent = 0` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Equality filters applied to event data; all pairs must match.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub event_filter: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ScheduleConfig {
    pub fn cron(workflow_name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            cron_expr: Some(expr.into()),
            event_type: None,
            event_filter: HashMap::new(),
            enabled: true,
            max_concurrent: 0,
            timeout_secs: default_timeout_secs(),
            metadata: HashMap::new(),
        }
    }

    pub fn event(workflow_name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            cron_expr: None,
            event_type: Some(event_type.into()),
            event_filter: HashMap::new(),
            enabled: true,
            max_concurrent: 0,
            timeout_secs: default_timeout_secs(),
            metadata: HashMap::new(),
        }
    }

    pub fn validate(&self) -> SwarmResult<()> {
        if self.workflow_name.is_empty() {
            return Err(SwarmError::validation(
                "workflow_name",
                "schedule must name a workflow",
            ));
        }
        match (&self.cron_expr, &self.event_type) {
            (None, None) => Err(SwarmError::validation(
                "cron_expr",
                "schedule needs a cron expression or an event type",
            )),
            (Some(_), Some(_)) => Err(SwarmError::validation(
                "cron_expr",
                "schedule cannot have both a cron expression and an event type",
            )),
            (Some(expr), None) => {
                use std::str::FromStr;
                cron::Schedule::from_str(expr).map_err(|e| {
                    SwarmError::validation("cron_expr", format!("invalid cron expression: {e}"))
                })?;
                Ok(())
            }
            (None, Some(_)) => Ok(()),
        }
    }

    /// Whether an event's data passes this schedule's equality filters.
    pub fn matches_event(&self, data: &HashMap<String, serde_json::Value>) -> bool {
        self.event_filter.iter().all(|(field, expected)| {
            data.get(field).is_some_and(|v| match v {
                serde_json::Value::String(s) => s == expected,
                other => other.to_string() == *expected,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cron_schedule_validates() {
        let cfg = ScheduleConfig::cron("nightly", "0 0 2 * * *");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_cron_rejected() {
        let cfg = ScheduleConfig::cron("nightly", "not a cron");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_neither_trigger_rejected() {
        let mut cfg = ScheduleConfig::cron("x", "* * * * * *");
        cfg.cron_expr = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_event_filter_match() {
        let mut cfg = ScheduleConfig::event("on-threat", "threat.detected");
        cfg.event_filter.insert("severity".into(), "high".into());

        let mut data = HashMap::new();
        data.insert("severity".into(), json!("high"));
        data.insert("source".into(), json!("edge"));
        assert!(cfg.matches_event(&data));

        data.insert("severity".into(), json!("low"));
        assert!(!cfg.matches_event(&data));

        data.remove("severity");
        assert!(!cfg.matches_event(&data));
    }

    #[test]
    fn test_numeric_filter_values_compare_stringwise() {
        let mut cfg = ScheduleConfig::event("on-batch", "batch.done");
        cfg.event_filter.insert("count".into(), "3".into());

        let mut data = HashMap::new();
        data.insert("count".into(), json!(3));
        assert!(cfg.matches_event(&data));
    }
}
