//! Tools callable by the chat model and the agent loop.
//!
//! Every tool implements [`Tool`]: a name, a one-line description, a JSON
//! Schema for its parameters, and an async `execute`. [`ToolRegistry`] is
//! the capability table; [`ToolRegistry::dispatch`] is the only way tools
//! are invoked. It validates parameters against the schema first, and it
//! turns every failure into text the model can read:
//!
//! | Failure | Output |
//! |---------|--------|
//! | unknown name | `Error: Tool '<name>' not found. Available tools: ...` |
//! | bad parameters | `Error: invalid parameters for <name>: <reason>` |
//! | execution error | `Error executing <name>: <reason>` |

pub mod builtin;
pub mod calc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A named capability the model may call.
///
/// `parameters_schema` must be a JSON Schema object with
/// `type: "object"`, `properties`, and optionally `required`.
/// `execute` receives parameters that already passed
/// [`validate_params`], with defaults filled in.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value) -> Result<String>;
}

/// Result of a dispatched tool call. `is_error` marks outputs produced by
/// a failure rather than by the tool itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(output: String) -> Self {
        Self { output, is_error: false }
    }

    fn error(output: String) -> Self {
        Self { output, is_error: true }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Tool declarations in the function-calling format chat models accept.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    /// Plain-text tool listing for prompts that do not use native tool calls.
    pub fn describe(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {} Parameters: {}", t.name(), t.description(), t.parameters_schema()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn dispatch(&self, name: &str, params: Value) -> ToolOutcome {
        let Some(tool) = self.find(name) else {
            tracing::warn!(tool = name, "unknown tool requested");
            return ToolOutcome::error(format!(
                "Error: Tool '{}' not found. Available tools: {}",
                name,
                self.names().join(", ")
            ));
        };

        let params = match validate_params(&tool.parameters_schema(), &params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool parameters rejected");
                return ToolOutcome::error(format!("Error: invalid parameters for {}: {}", name, e));
            }
        };

        tracing::debug!(tool = name, %params, "executing tool");
        match tool.execute(params).await {
            Ok(output) => ToolOutcome::ok(output),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool execution failed");
                ToolOutcome::error(format!("Error executing {}: {}", name, e))
            }
        }
    }
}

/// The part of JSON Schema that tool parameter schemas use.
#[derive(Debug, Default, Deserialize)]
struct ParamSchema {
    #[serde(default)]
    properties: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ParamSpec {
    #[serde(rename = "type")]
    kind: Option<ParamKind>,
    #[serde(rename = "enum")]
    choices: Option<Vec<Value>>,
    default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
    #[serde(other)]
    Unchecked,
}

impl ParamKind {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match (self, Self::of(value)) {
            (Self::Unchecked, _) => true,
            (Self::Number, Self::Integer) => true,
            (want, got) => want == got,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
            Self::Null => "null",
            Self::Unchecked => "any value",
        }
    }
}

/// Check `params` against a tool's parameter schema and fill in defaults.
///
/// Every problem is reported at once, joined by `"; "`. Parameters the
/// schema does not mention pass through untouched, and a non-object
/// `params` counts as `{}`.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let schema: ParamSchema =
        serde_json::from_value(schema.clone()).context("tool parameter schema is malformed")?;
    let mut given: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
    let mut problems = Vec::new();

    for name in &schema.required {
        if !given.contains_key(name) {
            problems.push(format!("'{}' is required", name));
        }
    }

    for (name, spec) in &schema.properties {
        match given.get(name) {
            None => {
                if let Some(default) = &spec.default {
                    given.insert(name.clone(), default.clone());
                }
            }
            Some(value) => {
                if let Some(kind) = spec.kind.filter(|k| !k.accepts(value)) {
                    problems.push(format!(
                        "'{}' should be {}, not {}",
                        name,
                        kind.label(),
                        ParamKind::of(value).label()
                    ));
                } else if let Some(choices) = spec.choices.as_ref().filter(|c| !c.contains(value)) {
                    let listed: Vec<String> = choices.iter().map(Value::to_string).collect();
                    problems.push(format!("'{}' must be one of {}, not {}", name, listed.join(" | "), value));
                }
            }
        }
    }

    if !problems.is_empty() {
        bail!("{}", problems.join("; "));
    }
    Ok(Value::Object(given))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo text back."
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "times": { "type": "integer", "default": 1 },
                    "style": { "type": "string", "enum": ["plain", "loud"] }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value) -> Result<String> {
            let text = params["text"].as_str().unwrap_or_default();
            if text == "boom" {
                bail!("exploded");
            }
            let times = params["times"].as_u64().unwrap_or(1) as usize;
            Ok(text.repeat(times))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo));
        registry
    }

    #[test]
    fn test_validate_injects_defaults() {
        let schema = Echo.parameters_schema();
        let out = validate_params(&schema, &json!({ "text": "hi" })).unwrap();
        assert_eq!(out, json!({ "text": "hi", "times": 1 }));
    }

    #[test]
    fn test_validate_rejects() {
        let schema = Echo.parameters_schema();
        let missing = validate_params(&schema, &json!({})).unwrap_err();
        assert_eq!(missing.to_string(), "'text' is required");
        let wrong_type = validate_params(&schema, &json!({ "text": 5 })).unwrap_err();
        assert_eq!(wrong_type.to_string(), "'text' should be a string, not an integer");
        let bad_enum = validate_params(&schema, &json!({ "text": "a", "style": "shout" })).unwrap_err();
        assert_eq!(
            bad_enum.to_string(),
            "'style' must be one of \"plain\" | \"loud\", not \"shout\""
        );
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let schema = Echo.parameters_schema();
        let err = validate_params(&schema, &json!({ "times": 1.5, "style": "loud" })).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'text' is required; 'times' should be an integer, not a number"
        );
    }

    #[test]
    fn test_validate_number_accepts_integers_and_keeps_extras() {
        let schema = json!({
            "type": "object",
            "properties": { "x": { "type": "number" }, "any": {} }
        });
        let out = validate_params(&schema, &json!({ "x": 3, "any": null, "extra": true })).unwrap();
        assert_eq!(out, json!({ "x": 3, "any": null, "extra": true }));
        assert!(validate_params(&json!({ "required": "x" }), &json!({})).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_outcomes() {
        let registry = registry();
        let ok = registry.dispatch("echo", json!({ "text": "ab", "times": 2 })).await;
        assert_eq!(ok, ToolOutcome::ok("abab".into()));

        let unknown = registry.dispatch("nope", json!({})).await;
        assert!(unknown.is_error);
        assert_eq!(unknown.output, "Error: Tool 'nope' not found. Available tools: echo");

        let invalid = registry.dispatch("echo", json!({})).await;
        assert!(invalid.is_error);
        assert!(invalid.output.starts_with("Error: invalid parameters for echo:"));

        let failed = registry.dispatch("echo", json!({ "text": "boom" })).await;
        assert_eq!(failed, ToolOutcome::error("Error executing echo: exploded".into()));
    }

    #[test]
    fn test_schemas_use_function_format() {
        let schemas = registry().schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "echo");
        assert_eq!(schemas[0]["function"]["parameters"]["required"][0], "text");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Box::new(Echo));
        assert_eq!(registry.len(), 1);
    }
}
