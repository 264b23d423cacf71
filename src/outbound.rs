//! Messages the orchestrator sends to its external collaborators.
//!
//! The transcript sink, the synthesizer, the audio transport and every tool
//! provider sit behind [`Outbound`]. Field names match the collaborator
//! protocol, so every type here serializes straight onto the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::context::Role;

/// What a transcript line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// Spoken text.
    Transcribe,
    /// Structured side-channel payload, e.g. reasoning.
    Raw,
}

/// One transcript update for a display sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub data_type: TranscriptKind,
    pub role: Role,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub text_ts: i64,
    pub is_final: bool,
    pub stream_id: i64,
}

impl TranscriptMessage {
    /// Spoken transcript stamped with the current time.
    pub fn spoken(role: Role, text: impl Into<String>, is_final: bool, stream_id: i64) -> Self {
        Self {
            data_type: TranscriptKind::Transcribe,
            role,
            text: text.into(),
            text_ts: chrono::Utc::now().timestamp_millis(),
            is_final,
            stream_id,
        }
    }

    /// Assistant reasoning wrapped as `{"type":"reasoning","data":{"text":...}}`.
    pub fn reasoning(text: &str, is_final: bool, stream_id: i64) -> Self {
        let payload = serde_json::json!({
            "type": "reasoning",
            "data": { "text": text },
        });
        Self {
            data_type: TranscriptKind::Raw,
            role: Role::Assistant,
            text: payload.to_string(),
            text_ts: chrono::Utc::now().timestamp_millis(),
            is_final,
            stream_id,
        }
    }
}

/// Routing metadata attached to every synthesis input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisMetadata {
    pub session_id: String,
    pub turn_id: u64,
}

/// Text for the speech synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub request_id: String,
    pub text: String,
    /// Marks the last input of a synthesis request.
    pub text_input_end: bool,
    pub metadata: SynthesisMetadata,
}

impl SynthesisInput {
    /// Build an input whose request id is derived from the turn.
    pub fn for_turn(
        turn_id: u64,
        session_id: impl Into<String>,
        text: impl Into<String>,
        text_input_end: bool,
    ) -> Self {
        Self {
            request_id: format!("tts-request-{turn_id}"),
            text: text.into(),
            text_input_end,
            metadata: SynthesisMetadata {
                session_id: session_id.into(),
                turn_id,
            },
        }
    }
}

/// Instructs the synthesizer to drop everything buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisFlush {
    pub flush_id: String,
}

impl SynthesisFlush {
    pub fn new() -> Self {
        Self {
            flush_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for SynthesisFlush {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool invocation routed to the collaborator that registered the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallCommand {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Successful tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: String,
}

/// Every side effect the orchestrator has on the outside world.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_transcript(&self, message: TranscriptMessage) -> Result<()>;

    async fn send_synthesis(&self, input: SynthesisInput) -> Result<()>;

    async fn flush_synthesis(&self, flush: SynthesisFlush) -> Result<()>;

    /// Stop audio playback downstream of the synthesizer.
    async fn flush_audio(&self) -> Result<()>;

    /// Execute `command` on the collaborator named `source`.
    ///
    /// # Errors
    ///
    /// [`AgentError::ToolExecution`](crate::error::AgentError::ToolExecution)
    /// when the collaborator reports failure.
    async fn call_tool(&self, source: &str, command: ToolCallCommand) -> Result<ToolCallResult>;
}

#[async_trait]
impl<T: Outbound + ?Sized> Outbound for std::sync::Arc<T> {
    async fn send_transcript(&self, message: TranscriptMessage) -> Result<()> {
        (**self).send_transcript(message).await
    }

    async fn send_synthesis(&self, input: SynthesisInput) -> Result<()> {
        (**self).send_synthesis(input).await
    }

    async fn flush_synthesis(&self, flush: SynthesisFlush) -> Result<()> {
        (**self).flush_synthesis(flush).await
    }

    async fn flush_audio(&self) -> Result<()> {
        (**self).flush_audio().await
    }

    async fn call_tool(&self, source: &str, command: ToolCallCommand) -> Result<ToolCallResult> {
        (**self).call_tool(source, command).await
    }
}
