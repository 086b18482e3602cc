//! The boundary between the engine and the embedded script sandbox.
//!
//! Native callers see raw [`Value`]s, NaN included. Values handed to script
//! code cross a JSON serialization boundary where IEEE NaN and the
//! infinities cannot be represented; [`to_script_json`] is the single place
//! where they are normalized to `null`.

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::Value;

/// Executes `$function` bodies in an isolated sandbox. The body only sees
/// the already-evaluated `args`.
pub trait ScriptHost: Send + Sync {
    fn call(&self, lang: &str, body: &str, args: &[Value]) -> Result<Value>;
}

/// Result envelope returned by the scripted `evaluate()` surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptResult {
    pub result: JsonValue,
}

impl ScriptResult {
    pub fn from_native(value: &Value) -> Self {
        Self {
            result: to_script_json(value),
        }
    }

    pub fn is_null(&self) -> bool {
        self.result.is_null()
    }
}

/// Error shape raised inside the sandbox for structural failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
}

impl From<&Error> for ScriptError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            stage: err.stage_index(),
        }
    }
}

impl From<Error> for ScriptError {
    fn from(err: Error) -> Self {
        ScriptError::from(&err)
    }
}

/// Convert a native value to the JSON a script observes. Non-finite floats
/// become `null` at any depth.
pub fn to_script_json(value: &Value) -> JsonValue {
    value.to_json()
}

/// Convert a native evaluation outcome into the scripted surface.
pub fn to_script_result(outcome: Result<Value>) -> std::result::Result<ScriptResult, ScriptError> {
    outcome
        .map(|v| ScriptResult::from_native(&v))
        .map_err(ScriptError::from)
}
