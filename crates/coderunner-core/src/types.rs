//! Wire types shared by the job intake, the orchestrator and the engine.
//!
//! `ExecutionRequest` flows in from the job intake. `EngineReport` is what the
//! in-container engine prints as its single line of output. `ExecutionResult`
//! is the report enriched with the submission identifier and an optional
//! infrastructure error, and is what leaves the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::EngineSettings;

/// Default inner deadline in seconds when a request does not carry one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A single blacklist rule: a dotted path to a host function and the reason
/// reported when untrusted code calls it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenRule {
    pub path: String,
    pub reason: String,
}

/// Capability restriction configuration staged next to the submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub blacklist: Vec<ForbiddenRule>,
}

/// Contents of the `config.json` staged next to a submission. Engine settings
/// are optional so a hand-written file with only a blacklist stays valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedConfig {
    #[serde(default)]
    pub blacklist: Vec<ForbiddenRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub submission_id: String,
    pub code: String,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Snapshot of one top-level binding left behind by the submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value_preview: String,
    #[serde(default)]
    pub shape: Option<Vec<i64>>,
}

pub type VariableMap = BTreeMap<String, VariableInfo>;

/// Result produced inside the sandbox, before the orchestrator attaches the
/// submission identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub memory_peak_mb: Option<f64>,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub variables: Option<VariableMap>,
}

impl EngineReport {
    /// Failure synthesized outside the engine (deadline, crash, missing input).
    pub fn failure(error: impl Into<String>, execution_time: Option<f64>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            truncated: false,
            memory_peak_mb: None,
            execution_time,
            variables: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub truncated: bool,
    pub memory_peak_mb: Option<f64>,
    pub execution_time: Option<f64>,
    pub variables: Option<VariableMap>,
    pub system_error: Option<String>,
}

impl ExecutionResult {
    pub fn from_report(submission_id: impl Into<String>, report: EngineReport) -> Self {
        let success = report.success && report.error.is_none();
        Self {
            submission_id: submission_id.into(),
            success,
            output: report.output,
            error: report.error,
            truncated: report.truncated,
            memory_peak_mb: report.memory_peak_mb.map(|mb| mb.max(0.0)),
            execution_time: report.execution_time.map(|secs| secs.max(0.0)),
            variables: report.variables,
            system_error: None,
        }
    }

    /// Infrastructure-level failure, distinct from anything the submission did.
    pub fn system_failure(submission_id: impl Into<String>, system_error: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            success: false,
            output: String::new(),
            error: None,
            truncated: false,
            memory_peak_mb: None,
            execution_time: None,
            variables: None,
            system_error: Some(system_error.into()),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: ExecutionRequest =
            serde_json::from_value(json!({"submission_id": "42", "code": "print(1);"})).unwrap();

        assert_eq!(request.timeout, DEFAULT_TIMEOUT_SECS);
        assert!(request.config.blacklist.is_empty());
    }

    #[test]
    fn test_request_with_blacklist() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "submission_id": "a1",
            "code": "",
            "config": {"blacklist": [{"path": "time.sleep", "reason": "no sleeping"}]},
            "timeout": 3
        }))
        .unwrap();

        assert_eq!(request.timeout, 3);
        assert_eq!(
            request.config.blacklist,
            vec![ForbiddenRule {
                path: "time.sleep".to_string(),
                reason: "no sleeping".to_string()
            }]
        );
    }

    #[test]
    fn test_staged_config_accepts_bare_blacklist() {
        let staged: StagedConfig = serde_json::from_str(r#"{"blacklist": []}"#).unwrap();

        assert!(staged.blacklist.is_empty());
        assert!(staged.engine.is_none());
        assert_eq!(serde_json::to_value(&staged).unwrap(), json!({"blacklist": []}));
    }

    #[test]
    fn test_from_report_forces_failure_when_error_present() {
        let report = EngineReport {
            success: true,
            error: Some("RuntimeError: boom".to_string()),
            ..Default::default()
        };
        let result = ExecutionResult::from_report("s1", report);

        assert!(!result.success);
        assert_eq!(result.submission_id, "s1");
        assert!(result.system_error.is_none());
    }

    #[test]
    fn test_system_failure_shape() {
        let result = ExecutionResult::system_failure("s2", "Container timeout");
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["submission_id"], "s2");
        assert_eq!(value["success"], false);
        assert_eq!(value["system_error"], "Container timeout");
        assert!(value["error"].is_null());
        assert!(value["variables"].is_null());
    }

    #[test]
    fn test_variable_info_serializes_type_key() {
        let info = VariableInfo {
            type_name: "array".to_string(),
            value_preview: "<array object>".to_string(),
            shape: Some(vec![2, 3]),
        };
        let value = serde_json::to_value(&info).unwrap();

        assert_eq!(value, json!({"type": "array", "value_preview": "<array object>", "shape": [2, 3]}));
    }
}
