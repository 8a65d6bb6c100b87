//! Transition protocol
//!
//! Wire form of the records steps exchange with their caller, the override
//! convention that lets a function redirect control flow, and [`Handler`],
//! the entry point a managed backend calls with one record per invocation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use crate::compiler::CompiledProgram;
use crate::errors::{FnfigResult, RunError};
use crate::types::{Action, Context, Transition, BEGIN_ACTION};

/// Key in the override payload that names the target step
pub const OVERRIDE_MARKER: &str = "_next_step";

/* ===================== Override Convention ===================== */

/// Return `value` as the result and continue at `target` instead of the
/// statement's default successor
pub fn go_to(value: JsonValue, target: impl Into<String>) -> JsonValue {
    json!([value, { OVERRIDE_MARKER: target.into() }])
}

/// Return `value` and end the workflow immediately
pub fn go_to_end(value: JsonValue) -> JsonValue {
    go_to(value, crate::types::END_ACTION)
}

/// Unwrap an override payload `[value, {"_next_step": target}]`
///
/// Anything else is an ordinary result and comes back untouched.
pub fn split_override(result: JsonValue, step: &str) -> Result<(JsonValue, Option<String>), RunError> {
    let is_override = matches!(
        &result,
        JsonValue::Array(items)
            if items.len() == 2
                && items[1].as_object().map(|o| o.contains_key(OVERRIDE_MARKER)).unwrap_or(false)
    );
    if !is_override {
        return Ok((result, None));
    }

    let mut items = match result {
        JsonValue::Array(items) => items,
        other => return Ok((other, None)),
    };
    let marker = items.pop().unwrap_or(JsonValue::Null);
    let value = items.pop().unwrap_or(JsonValue::Null);

    match marker.get(OVERRIDE_MARKER).and_then(JsonValue::as_str) {
        Some(target) if !target.is_empty() => Ok((value, Some(target.to_string()))),
        _ => Err(RunError::protocol(
            step,
            format!("override target must be a non-empty step name, got {}", marker),
        )),
    }
}

/* ===================== Wire Record ===================== */

/// Transition record as it crosses process boundaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_keys: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_values: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_key: Option<JsonValue>,
    /// Output of a single fan-out worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_value: Option<JsonValue>,
}

impl TransitionRecord {
    /// Wire form of a step's output
    pub fn from_transition(transition: &Transition, program: &CompiledProgram) -> Self {
        match transition {
            Transition::Retry { after_seconds } => Self {
                wait: Some(*after_seconds),
                ..Default::default()
            },
            Transition::Advance(advance) => Self {
                action: Some(program.action_name(advance.action).to_string()),
                wait: Some(advance.wait),
                result: Some(advance.result.clone()),
                iteration_keys: advance.iteration_keys.clone(),
                iteration_values: advance.iteration_values.clone(),
                iteration_key: None,
                iteration_value: advance.iteration_value.clone(),
            },
        }
    }

    /// Fill missing fields the way a fresh invocation sees them
    fn into_context(self, action: Action) -> Context {
        Context {
            action,
            wait: self.wait.unwrap_or(0),
            result: self.result.unwrap_or(JsonValue::Null),
            iteration_keys: self.iteration_keys,
            iteration_values: self.iteration_values,
            iteration_key: self.iteration_key,
        }
    }
}

/* ===================== Handler ===================== */

/// Per-invocation entry point for a compiled program
#[derive(Debug, Clone)]
pub struct Handler {
    program: Arc<CompiledProgram>,
}

impl Handler {
    pub fn new(program: Arc<CompiledProgram>) -> Self {
        Self { program }
    }

    /// Run the step named by `event.action` once and return its record
    pub fn handle(&self, event: TransitionRecord) -> Result<TransitionRecord, RunError> {
        let action_name = event
            .action
            .clone()
            .ok_or_else(|| RunError::protocol(BEGIN_ACTION, "event carries no action"))?;

        let mut record = if action_name == BEGIN_ACTION {
            TransitionRecord {
                action: Some(self.program.action_name(self.program.entry()).to_string()),
                ..Default::default()
            }
        } else {
            let step = match self.program.resolve(&action_name) {
                Some(Action::Step(id)) => self.program.step(id),
                _ => None,
            }
            .ok_or_else(|| RunError::UnresolvedAction(action_name.clone()))?;

            tracing::debug!(step = %step.name, "invoking step");
            let ctx = event.into_context(Action::Step(step.id));
            let transition = step.invoke(&ctx)?;
            TransitionRecord::from_transition(&transition, &self.program)
        };

        if record.wait.is_none() {
            record.wait = Some(0);
            if record.action.is_none() {
                return Err(RunError::protocol(&action_name, "action is missing"));
            }
        }
        if record.action.is_none() && record.wait == Some(0) {
            return Err(RunError::protocol(
                &action_name,
                "record without action must request a wait",
            ));
        }

        Ok(record)
    }

    /// JSON-in, JSON-out variant of [`Handler::handle`]
    pub fn handle_json(&self, event: &str) -> FnfigResult<String> {
        let event: TransitionRecord = serde_json::from_str(event)?;
        let record = self.handle(event)?;
        Ok(serde_json::to_string(&record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, FunctionRegistry};
    use crate::parser::parse_lines;
    use maplit::hashmap;
    use serde_json::json;

    fn handler(lines: &[&str], registry: FunctionRegistry) -> Handler {
        let program = parse_lines(lines).expect("Parse failed");
        let compiled = compile(&program, &registry).expect("Compile failed");
        Handler::new(Arc::new(compiled))
    }

    #[test]
    fn test_split_override_recognizes_marker() {
        let (value, target) = split_override(go_to_end(json!(7)), "s").unwrap();
        assert_eq!(value, json!(7));
        assert_eq!(target.as_deref(), Some("end"));
    }

    #[test]
    fn test_split_override_leaves_ordinary_pairs() {
        for result in [json!([1, 2]), json!([1, {"other": "x"}]), json!([1, {}, 3]), json!("x")] {
            let (value, target) = split_override(result.clone(), "s").unwrap();
            assert_eq!(value, result);
            assert!(target.is_none());
        }
    }

    #[test]
    fn test_split_override_rejects_bad_target() {
        for marker in [json!(""), json!(5), json!(null)] {
            let payload = json!([1, { OVERRIDE_MARKER: marker }]);
            assert!(matches!(
                split_override(payload, "s"),
                Err(RunError::ProtocolViolation { .. })
            ));
        }
    }

    #[test]
    fn test_record_uses_wire_field_names() {
        let record = TransitionRecord {
            action: Some("x".into()),
            wait: Some(0),
            iteration_keys: Some(vec![json!(1)]),
            iteration_values: Some(vec![]),
            iteration_key: Some(json!("k")),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();

        for field in ["action", "wait", "iterationKeys", "iterationValues", "iterationKey"] {
            assert!(keys.contains(&field), "missing {}", field);
        }
        assert!(!keys.contains(&"result"));
    }

    #[test]
    fn test_begin_points_at_first_step() {
        let handler = handler(&["step1"], FunctionRegistry::new().call("step1", |r| Ok(r)));
        let out = handler
            .handle_json(r#"{"action": "begin", "result": {"a": 1}}"#)
            .unwrap();
        let out: JsonValue = serde_json::from_str(&out).unwrap();

        assert_eq!(out, json!({"action": "_func_step1_0", "wait": 0}));
    }

    #[test]
    fn test_step_invocation_round_trip() {
        let handler = handler(
            &["step1", "step2"],
            FunctionRegistry::new()
                .call("step1", |mut result| {
                    result["x"] = json!(2021);
                    Ok(result)
                })
                .call("step2", |r| Ok(r)),
        );

        let record = handler
            .handle(TransitionRecord {
                action: Some("_func_step1_0".into()),
                result: Some(json!({"userInputKey": "userInputValue"})),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(record.action.as_deref(), Some("_func_step2_1"));
        assert_eq!(record.wait, Some(0));
        assert_eq!(
            record.result,
            Some(json!({"userInputKey": "userInputValue", "x": 2021}))
        );
    }

    #[test]
    fn test_retry_record_has_no_action() {
        let handler = handler(
            &["step1", "wait 3 until ready", "step2"],
            FunctionRegistry::new()
                .call("step1", |r| Ok(r))
                .condition("ready", |_| Ok(false))
                .call("step2", |r| Ok(r)),
        );

        let record = handler
            .handle(TransitionRecord {
                action: Some("_wait_3_until_ready_1".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(record, TransitionRecord { wait: Some(3), ..Default::default() });
    }

    #[test]
    fn test_worker_invocation_reports_value() {
        let handler = handler(
            &["init", "foreach items", "combine"],
            FunctionRegistry::new()
                .fan_out("init", |result| Ok((result, vec![json!(1)])))
                .iteration("items", |_, key| Ok(json!(key.as_i64().unwrap_or(0) * 10)))
                .reduce("combine", |result, _| Ok(result)),
        );

        let event = hashmap! {
            "action" => json!("_foreach_items_1"),
            "iterationKey" => json!(4),
            "result" => json!({}),
        };
        let out = handler
            .handle_json(&serde_json::to_string(&event).unwrap())
            .unwrap();
        let out: JsonValue = serde_json::from_str(&out).unwrap();

        assert_eq!(out["iterationValue"], json!(40));
        assert_eq!(out["action"], json!("_func_combine_2"));
    }

    #[test]
    fn test_unknown_action_is_unresolved() {
        let handler = handler(&["step1"], FunctionRegistry::new().call("step1", |r| Ok(r)));

        for action in ["nope", "end"] {
            let err = handler
                .handle(TransitionRecord {
                    action: Some(action.into()),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, RunError::UnresolvedAction(ref name) if name == action));
        }
    }

    #[test]
    fn test_event_without_action_is_violation() {
        let handler = handler(&["step1"], FunctionRegistry::new().call("step1", |r| Ok(r)));
        assert!(matches!(
            handler.handle(TransitionRecord::default()),
            Err(RunError::ProtocolViolation { .. })
        ));
    }
}
