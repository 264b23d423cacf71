//! Boundary to the external model transport.
//!
//! The transport owns the provider wire format, reconnection and timeouts.
//! The engine only sees a [`ChatCompletionRequest`] going out and a stream of
//! [`ModelChunk`]s coming back.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use super::context::ContextMessage;
use crate::error::Result;

/// Sampling parameters forwarded with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl From<&crate::config::LlmConfig> for ModelParameters {
    fn from(config: &crate::config::LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            extra: config.extra.clone(),
        }
    }
}

/// One streaming chat-completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub request_id: String,
    pub messages: Vec<ContextMessage>,
    /// Tool definitions (see [`ToolMetadata::to_definition`](crate::events::ToolMetadata::to_definition)).
    pub tools: Vec<serde_json::Value>,
    pub model: String,
    pub parameters: ModelParameters,
}

/// A streamed unit of model output, classified by the transport adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelChunk {
    /// New assistant text. `text`, when sent, is the whole message so far.
    MessageDelta {
        delta: String,
        #[serde(default)]
        text: String,
    },
    /// The assistant message is complete.
    MessageDone { text: String },
    ReasoningDelta {
        delta: String,
        #[serde(default)]
        text: String,
    },
    ReasoningDone { text: String },
    /// The model wants a tool executed.
    ToolCall {
        call_id: String,
        /// Provider response item id, when the provider has one.
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// A chunk type this build does not understand.
    #[serde(other)]
    Unknown,
}

/// Boxed stream of transport chunks. An `Err` item ends the request as aborted.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

/// Streaming model transport.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Open a streaming completion.
    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChunkStream>;

    /// Tell the transport to stop generating for `request_id`.
    async fn abort(&self, request_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: ModelTransport + ?Sized> ModelTransport for std::sync::Arc<T> {
    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        (**self).chat_completion(request).await
    }

    async fn abort(&self, request_id: &str) -> Result<()> {
        (**self).abort(request_id).await
    }
}
