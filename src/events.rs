//! Semantic agent events delivered to registered handlers.
//!
//! Every [`AgentEvent`] belongs to exactly one lane:
//!
//! ```text
//! SpeechResult   → Speech Lane
//! ModelResponse  → Model-Response Lane
//! everything else → dispatched immediately
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// One handler-dispatch unit.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A user joined the session.
    UserJoined,
    /// A user left the session.
    UserLeft,
    /// A collaborator registered a tool the model may call.
    ToolRegister {
        tool: ToolMetadata,
        /// Collaborator that owns the tool and receives its calls.
        source: String,
    },
    /// Incremental or final speech-recognition result.
    SpeechResult(SpeechResult),
    /// Incremental or final model output.
    ModelResponse(ModelResponse),
}

/// Which lane an event travels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    Speech,
    ModelResponse,
    /// Out-of-band: dispatched as soon as it arrives.
    Immediate,
}

impl AgentEvent {
    /// The lane this event is ordered in.
    pub fn lane(&self) -> LaneKind {
        match self {
            Self::SpeechResult(_) => LaneKind::Speech,
            Self::ModelResponse(_) => LaneKind::ModelResponse,
            Self::UserJoined | Self::UserLeft | Self::ToolRegister { .. } => LaneKind::Immediate,
        }
    }

    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::ToolRegister { .. } => "tool_register",
            Self::SpeechResult(_) => "speech_result",
            Self::ModelResponse(_) => "model_response",
        }
    }
}

/// A speech-recognition result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechResult {
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SpeechResult {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a `session_id` metadata entry.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.insert(
            "session_id".to_owned(),
            serde_json::Value::String(session_id.into()),
        );
        self
    }

    /// Session id from metadata. Numeric ids are accepted and stringified.
    pub fn session_id(&self) -> Option<String> {
        match self.metadata.get("session_id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Whether model output is user-facing text or hidden reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Message,
    Reasoning,
}

/// Incremental model output raised by the model execution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    /// The newly received fragment (empty for completions).
    pub delta: String,
    /// Full text accumulated so far in this message or reasoning block.
    pub text: String,
    pub is_final: bool,
    pub kind: ResponseKind,
}

/// One declared tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Tool description supplied by the collaborator that implements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Parse and validate tool metadata from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] when the payload is not valid metadata.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let tool: Self = serde_json::from_value(value)
            .map_err(|e| AgentError::Config(format!("invalid tool metadata: {e}")))?;
        tool.validate()?;
        Ok(tool)
    }

    /// Reject empty names and duplicate parameter names.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Config("tool name cannot be empty".to_owned()));
        }
        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(AgentError::Config(format!(
                    "tool '{}' has a parameter without a name",
                    self.name
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(AgentError::Config(format!(
                    "tool '{}' declares parameter '{}' twice",
                    self.name, param.name
                )));
            }
        }
        Ok(())
    }

    /// JSON-schema style definition handed to the model transport.
    pub fn to_definition(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": param.param_type,
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn events_map_to_lanes() {
        assert_eq!(AgentEvent::UserJoined.lane(), LaneKind::Immediate);
        assert_eq!(
            AgentEvent::SpeechResult(SpeechResult::new("hi", true)).lane(),
            LaneKind::Speech
        );
        let response = AgentEvent::ModelResponse(ModelResponse {
            delta: "a".into(),
            text: "a".into(),
            is_final: false,
            kind: ResponseKind::Message,
        });
        assert_eq!(response.lane(), LaneKind::ModelResponse);
    }

    #[test]
    fn speech_result_parses_wire_shape() {
        let result: SpeechResult = serde_json::from_value(serde_json::json!({
            "text": "hello",
            "final": true,
            "metadata": {"session_id": 42}
        }))
        .unwrap();
        assert!(result.is_final);
        assert_eq!(result.session_id().as_deref(), Some("42"));
    }

    #[test]
    fn speech_result_without_session() {
        let result = SpeechResult::new("hi", false);
        assert_eq!(result.session_id(), None);
        let result = result.with_session_id("7");
        assert_eq!(result.session_id().as_deref(), Some("7"));
    }

    #[test]
    fn tool_metadata_validates() {
        let tool = ToolMetadata::from_json(serde_json::json!({
            "name": "lookup",
            "description": "Look something up",
            "parameters": [
                {"name": "query", "type": "string", "description": "what", "required": true}
            ]
        }))
        .unwrap();
        assert_eq!(tool.name, "lookup");

        let def = tool.to_definition();
        assert_eq!(def["name"], "lookup");
        assert_eq!(def["parameters"]["required"][0], "query");
        assert_eq!(def["parameters"]["properties"]["query"]["type"], "string");
    }

    #[test]
    fn tool_metadata_rejects_malformed() {
        assert!(ToolMetadata::from_json(serde_json::json!({"description": "x"})).is_err());
        assert!(ToolMetadata::from_json(serde_json::json!({"name": "  "})).is_err());
        let dup = serde_json::json!({
            "name": "t",
            "parameters": [
                {"name": "a", "type": "string"},
                {"name": "a", "type": "number"}
            ]
        });
        assert!(matches!(
            ToolMetadata::from_json(dup),
            Err(AgentError::Config(_))
        ));
    }
}
