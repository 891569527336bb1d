use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed input contract of a tool. Raw arguments are parsed against it
/// before the tool runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSchema {
    /// A single non-empty line of text, e.g. an arithmetic expression.
    Text { max_len: usize },
    /// A JSON object. `required` keys must be present and declared
    /// `properties` must carry the declared primitive type.
    Json { schema: Value },
}

/// Arguments after successful schema validation.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolInput {
    Text(String),
    Json(serde_json::Map<String, Value>),
}

impl ToolInput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Json(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Json(map) => map.get(key),
            Self::Text(_) => None,
        }
    }
}

impl InputSchema {
    pub fn text() -> Self {
        Self::Text { max_len: 1024 }
    }

    /// Validate `raw` and produce typed input. The error string describes
    /// the first violation found.
    pub fn parse(&self, raw: &str) -> Result<ToolInput, String> {
        match self {
            Self::Text { max_len } => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err("expected non-empty input".into());
                }
                if trimmed.len() > *max_len {
                    return Err(format!("input longer than {max_len} bytes"));
                }
                Ok(ToolInput::Text(trimmed.to_string()))
            }
            Self::Json { schema } => {
                let value: Value = serde_json::from_str(raw.trim())
                    .map_err(|e| format!("invalid JSON: {e}"))?;
                let Value::Object(map) = value else {
                    return Err("expected a JSON object".into());
                };
                check_object(schema, &map)?;
                Ok(ToolInput::Json(map))
            }
        }
    }

    /// Human-readable description for prompts.
    pub fn describe(&self) -> String {
        match self {
            Self::Text { .. } => "plain text".to_string(),
            Self::Json { schema } => format!("JSON object matching {schema}"),
        }
    }
}

fn check_object(schema: &Value, map: &serde_json::Map<String, Value>) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !map.contains_key(key) {
                return Err(format!("missing required field `{key}`"));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, prop) in props {
            let (Some(value), Some(expected)) = (map.get(key), prop.get("type").and_then(|t| t.as_str()))
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("field `{key}` must be of type {expected}"));
            }
        }
    }
    Ok(())
}

/// Tool definition rendered into the prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// Trait implemented by each tool.
///
/// Execution is synchronous and bounded to the tool's own declared effect;
/// a tool never streams to the caller.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> InputSchema;

    fn execute(&self, input: ToolInput) -> Result<String, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// Failure of `ToolRegistry::invoke`. Always recoverable: the loop folds it
/// into an observation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("unknown tool `{0}`")]
    NotFound(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    Schema { tool: String, reason: String },
    #[error("`{tool}` failed: {cause}")]
    Execution { tool: String, cause: String },
}

impl InvocationError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Schema { .. } => "schema",
            Self::Execution { .. } => "execution",
        }
    }
}

/// Result at the tool invocation boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutcome {
    Success { success: bool, output: String },
    Failure { success: bool, error: String },
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Text fed back to the model as the observation.
    pub fn observation(&self) -> String {
        match self {
            Self::Success { output, .. } => output.clone(),
            Self::Failure { error, .. } => format!("Error: {error}"),
        }
    }
}

impl From<Result<String, InvocationError>> for ToolOutcome {
    fn from(result: Result<String, InvocationError>) -> Self {
        match result {
            Ok(output) => Self::success(output),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}
