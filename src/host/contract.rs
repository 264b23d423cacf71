//! Versioned host command/event envelopes for the JSON-lines bridge.

use serde::{Deserialize, Serialize};

use crate::events::SpeechResult;
use crate::llm::transport::ModelChunk;

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Commands a host may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "user.joined")]
    UserJoined,
    #[serde(rename = "user.left")]
    UserLeft,
    #[serde(rename = "tool.register")]
    ToolRegister,
    #[serde(rename = "speech.result")]
    SpeechResult,
    #[serde(rename = "model.chunk")]
    ModelChunk,
    #[serde(rename = "model.end")]
    ModelEnd,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserJoined => "user.joined",
            Self::UserLeft => "user.left",
            Self::ToolRegister => "tool.register",
            Self::SpeechResult => "speech.result",
            Self::ModelChunk => "model.chunk",
            Self::ModelEnd => "model.end",
            Self::ToolResult => "tool.result",
            Self::RuntimeStop => "runtime.stop",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user.joined" => Some(Self::UserJoined),
            "user.left" => Some(Self::UserLeft),
            "tool.register" => Some(Self::ToolRegister),
            "speech.result" => Some(Self::SpeechResult),
            "model.chunk" => Some(Self::ModelChunk),
            "model.end" => Some(Self::ModelEnd),
            "tool.result" => Some(Self::ToolResult),
            "runtime.stop" => Some(Self::RuntimeStop),
            _ => None,
        }
    }
}

/// Events the bridge emits towards the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Transcript,
    TtsTextInput,
    TtsFlush,
    AudioFlush,
    ToolCall,
    ModelChatCompletion,
    ModelAbort,
}

impl EventName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::TtsTextInput => "tts.text_input",
            Self::TtsFlush => "tts.flush",
            Self::AudioFlush => "audio.flush",
            Self::ToolCall => "tool.call",
            Self::ModelChatCompletion => "model.chat_completion",
            Self::ModelAbort => "model.abort",
        }
    }
}

/// A versioned response envelope from bridge -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned command envelope from host -> bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Deserialize the payload into the command's payload type.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ContractError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ContractError::new(
                ContractErrorKind::InvalidPayload,
                format!("invalid {} payload: {e}", self.command.as_str()),
            )
        })
    }
}

/// A versioned event envelope from bridge -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

/// `tool.register` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegisterPayload {
    /// Raw tool metadata, validated by the orchestrator.
    pub tool: serde_json::Value,
    pub source: String,
}

/// `speech.result` payload.
pub type SpeechResultPayload = SpeechResult;

/// `model.chunk` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChunkPayload {
    pub request_id: String,
    pub chunk: ModelChunk,
}

/// `model.end` payload. An `error` ends the request as aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEndPayload {
    pub request_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// `tool.result` payload, answering a `tool.call` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub call_id: String,
    pub ok: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
    InvalidPayload,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}

impl From<ContractError> for crate::error::AgentError {
    fn from(e: ContractError) -> Self {
        Self::Contract(e.to_string())
    }
}
