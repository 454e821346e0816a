// SPDX-License-Identifier: MIT OR Apache-2.0
//! Uniform result envelope returned by every operation.

use crate::op::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of one backend operation.
///
/// `output` holds the parsed backend output: a list when the backend emitted
/// several JSON lines, a single value when it emitted one. Free-text lines
/// are wrapped as `{"data": line}` so the envelope is always JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpResult {
    /// Overall success of the operation.
    pub result: bool,
    /// Operation name.
    pub operation: String,
    /// Arguments the operation ran with, for traceability.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
    /// Parsed backend output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure reason, when `result` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Errors collected while the operation ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_error_info: Vec<String>,
    /// Warnings collected while the operation ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_warning_info: Vec<String>,
    /// Wall-clock duration in seconds, stamped by the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_time: Option<f64>,
    /// Step results for composite operations (housekeeping).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<BTreeMap<String, OpResult>>,
}

impl OpResult {
    /// A successful envelope with no output yet.
    pub fn success(operation: Operation) -> Self {
        Self::new(operation, true)
    }

    /// A failed envelope carrying a reason.
    pub fn failure(operation: Operation, reason: impl Into<String>) -> Self {
        let mut e = Self::new(operation, false);
        e.reason = Some(reason.into());
        e
    }

    fn new(operation: Operation, result: bool) -> Self {
        Self {
            result,
            operation: operation.name().to_string(),
            args: BTreeMap::new(),
            output: None,
            reason: None,
            additional_error_info: Vec::new(),
            additional_warning_info: Vec::new(),
            exec_time: None,
            detail: None,
        }
    }

    /// Record an argument for traceability.
    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Attach parsed output.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Set the parsed output from a list of JSON values, collapsing a
    /// single-element list to the bare value.
    pub fn with_output_lines(mut self, mut lines: Vec<Value>) -> Self {
        self.output = match lines.len() {
            0 => None,
            1 => Some(lines.remove(0)),
            _ => Some(Value::Array(lines)),
        };
        self
    }

    /// Merge collected warnings and errors into the envelope.
    pub fn annotate(&mut self, errors: Vec<String>, warnings: Vec<String>) {
        self.additional_error_info.extend(errors);
        self.additional_warning_info.extend(warnings);
    }

    /// The output as a snapshot list, when it looks like one.
    pub fn output_as_array(&self) -> Vec<Value> {
        match &self.output {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_output_line_collapses() {
        let e = OpResult::success(Operation::Snapshots).with_output_lines(vec![json!({"id": "a"})]);
        assert_eq!(e.output, Some(json!({"id": "a"})));
    }

    #[test]
    fn multiple_output_lines_stay_a_list() {
        let e = OpResult::success(Operation::Snapshots)
            .with_output_lines(vec![json!({"id": "a"}), json!({"id": "b"})]);
        assert_eq!(e.output, Some(json!([{"id": "a"}, {"id": "b"}])));
        assert_eq!(e.output_as_array().len(), 2);
    }

    #[test]
    fn empty_output_lines_yield_none() {
        let e = OpResult::success(Operation::Snapshots).with_output_lines(vec![]);
        assert_eq!(e.output, None);
        assert!(e.output_as_array().is_empty());
    }

    #[test]
    fn failure_carries_reason_in_json() {
        let e = OpResult::failure(Operation::Forget, "empty retention policy");
        let js = serde_json::to_value(&e).unwrap();
        assert_eq!(js["result"], json!(false));
        assert_eq!(js["operation"], json!("forget"));
        assert_eq!(js["reason"], json!("empty retention policy"));
        // Empty annotation lists are not serialized.
        assert!(js.get("additional_error_info").is_none());
    }

    #[test]
    fn annotations_serialize_when_present() {
        let mut e = OpResult::success(Operation::Backup);
        e.annotate(vec!["boom".into()], vec!["careful".into()]);
        let js = serde_json::to_value(&e).unwrap();
        assert_eq!(js["additional_error_info"], json!(["boom"]));
        assert_eq!(js["additional_warning_info"], json!(["careful"]));
    }

    #[test]
    fn envelope_roundtrip() {
        let e = OpResult::success(Operation::Backup)
            .with_arg("force", true)
            .with_output(json!({"message_type": "summary"}));
        let text = serde_json::to_string(&e).unwrap();
        let back: OpResult = serde_json::from_str(&text).unwrap();
        assert_eq!(e, back);
    }
}
