//! Collaborators reached through the host process.
//!
//! [`HostBridge`] implements [`Outbound`] and [`ModelTransport`] by emitting
//! [`EventEnvelope`]s. Replies come back as commands (`model.chunk`,
//! `model.end`, `tool.result`) and are routed to whichever request stream or
//! tool call is waiting for them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::contract::{EventEnvelope, EventName, ModelChunkPayload, ModelEndPayload, ToolResultPayload};
use crate::error::{AgentError, Result};
use crate::llm::transport::{ChatCompletionRequest, ChunkStream, ModelChunk, ModelTransport};
use crate::outbound::{
    Outbound, SynthesisFlush, SynthesisInput, ToolCallCommand, ToolCallResult, TranscriptMessage,
};

type ChunkSender = mpsc::UnboundedSender<Result<ModelChunk>>;
type ToolReply = oneshot::Sender<Result<ToolCallResult>>;

/// Event-emitting collaborator facade.
pub struct HostBridge {
    events: mpsc::UnboundedSender<EventEnvelope>,
    streams: Mutex<HashMap<String, ChunkSender>>,
    tool_calls: Mutex<HashMap<String, ToolReply>>,
}

/// Removes a pending tool call when the caller stops waiting for it.
struct PendingToolCall<'a> {
    bridge: &'a HostBridge,
    call_id: String,
}

impl Drop for PendingToolCall<'_> {
    fn drop(&mut self) {
        lock(&self.bridge.tool_calls).remove(&self.call_id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HostBridge {
    /// Create a bridge and the receiver its events are written to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            events,
            streams: Mutex::new(HashMap::new()),
            tool_calls: Mutex::new(HashMap::new()),
        };
        (bridge, rx)
    }

    fn emit(&self, event: EventName, payload: impl serde::Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| AgentError::Contract(format!("failed to encode {}: {e}", event.as_str())))?;
        let envelope = EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event.as_str(), payload);
        self.events
            .send(envelope)
            .map_err(|_| AgentError::Channel("host event channel closed".to_owned()))
    }

    /// Forward a `model.chunk` to its request stream.
    ///
    /// Chunks for unknown or finished requests are dropped; they are
    /// normal after an abort.
    pub fn on_model_chunk(&self, payload: ModelChunkPayload) {
        let streams = lock(&self.streams);
        match streams.get(&payload.request_id) {
            Some(tx) => {
                let _ = tx.send(Ok(payload.chunk));
            }
            None => debug!(request_id = %payload.request_id, "chunk for inactive request"),
        }
    }

    /// Close a request stream, optionally with a transport error.
    pub fn on_model_end(&self, payload: ModelEndPayload) {
        let Some(tx) = lock(&self.streams).remove(&payload.request_id) else {
            debug!(request_id = %payload.request_id, "end for inactive request");
            return;
        };
        if let Some(reason) = payload.error {
            let _ = tx.send(Err(AgentError::Transport(reason)));
        }
    }

    /// Complete a pending tool call.
    ///
    /// # Errors
    ///
    /// [`AgentError::Contract`] when no call with that id is waiting.
    pub fn on_tool_result(&self, payload: ToolResultPayload) -> Result<()> {
        let Some(reply) = lock(&self.tool_calls).remove(&payload.call_id) else {
            return Err(AgentError::Contract(format!(
                "no pending tool call {}",
                payload.call_id
            )));
        };
        let result = if payload.ok {
            Ok(ToolCallResult {
                content: payload.content,
            })
        } else {
            Err(AgentError::ToolExecution(
                payload.error.unwrap_or_else(|| "tool failed".to_owned()),
            ))
        };
        let _ = reply.send(result);
        Ok(())
    }

    /// Requests whose stream is still open.
    pub fn open_requests(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Tool calls still waiting for a result.
    pub fn pending_tool_calls(&self) -> usize {
        lock(&self.tool_calls).len()
    }
}

#[async_trait]
impl Outbound for HostBridge {
    async fn send_transcript(&self, message: TranscriptMessage) -> Result<()> {
        self.emit(EventName::Transcript, message)
    }

    async fn send_synthesis(&self, input: SynthesisInput) -> Result<()> {
        self.emit(EventName::TtsTextInput, input)
    }

    async fn flush_synthesis(&self, flush: SynthesisFlush) -> Result<()> {
        self.emit(EventName::TtsFlush, flush)
    }

    async fn flush_audio(&self) -> Result<()> {
        self.emit(EventName::AudioFlush, serde_json::json!({}))
    }

    async fn call_tool(&self, source: &str, command: ToolCallCommand) -> Result<ToolCallResult> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.tool_calls).insert(call_id.clone(), tx);
        let _pending = PendingToolCall {
            bridge: self,
            call_id: call_id.clone(),
        };

        self.emit(
            EventName::ToolCall,
            serde_json::json!({
                "call_id": call_id,
                "source": source,
                "name": command.name,
                "arguments": command.arguments,
            }),
        )?;
        rx.await
            .map_err(|_| AgentError::ToolExecution(format!("tool call {call_id} dropped")))?
    }
}

#[async_trait]
impl ModelTransport for HostBridge {
    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        let request_id = request.request_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.streams).insert(request_id.clone(), tx);
        if let Err(e) = self.emit(EventName::ModelChatCompletion, &request) {
            lock(&self.streams).remove(&request_id);
            return Err(e);
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn abort(&self, request_id: &str) -> Result<()> {
        if lock(&self.streams).remove(request_id).is_none() {
            warn!(%request_id, "abort for inactive request");
        }
        self.emit(EventName::ModelAbort, serde_json::json!({ "request_id": request_id }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::transport::ModelParameters;
    use std::sync::Arc;

    fn request(id: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            request_id: id.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            model: "m".into(),
            parameters: ModelParameters::from(&LlmConfig::default()),
        }
    }

    #[tokio::test]
    async fn chunks_flow_to_the_matching_stream() {
        let (bridge, mut events) = HostBridge::new();
        let mut stream = bridge.chat_completion(request("q1")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "model.chat_completion");
        assert_eq!(event.payload["request_id"], "q1");

        bridge.on_model_chunk(ModelChunkPayload {
            request_id: "q1".into(),
            chunk: ModelChunk::MessageDone { text: "Hi.".into() },
        });
        bridge.on_model_chunk(ModelChunkPayload {
            request_id: "other".into(),
            chunk: ModelChunk::Unknown,
        });
        bridge.on_model_end(ModelEndPayload {
            request_id: "q1".into(),
            error: None,
        });

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, ModelChunk::MessageDone { text: "Hi.".into() });
        assert!(stream.next().await.is_none());
        assert_eq!(bridge.open_requests(), 0);
    }

    #[tokio::test]
    async fn end_with_error_yields_transport_error() {
        let (bridge, _events) = HostBridge::new();
        let mut stream = bridge.chat_completion(request("q1")).await.unwrap();
        bridge.on_model_end(ModelEndPayload {
            request_id: "q1".into(),
            error: Some("socket closed".into()),
        });
        assert!(matches!(
            stream.next().await,
            Some(Err(AgentError::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn abort_closes_stream_and_emits_event() {
        let (bridge, mut events) = HostBridge::new();
        let mut stream = bridge.chat_completion(request("q1")).await.unwrap();
        let _ = events.recv().await;

        bridge.abort("q1").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "model.abort");
        assert_eq!(event.payload["request_id"], "q1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn tool_call_waits_for_result() {
        let (bridge, mut events) = HostBridge::new();
        let bridge = Arc::new(bridge);

        let caller = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .call_tool(
                        "ext-weather",
                        ToolCallCommand {
                            name: "weather".into(),
                            arguments: serde_json::json!({"city": "Oslo"}),
                        },
                    )
                    .await
            }
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "tool.call");
        assert_eq!(event.payload["source"], "ext-weather");
        let call_id = event.payload["call_id"].as_str().unwrap().to_owned();

        bridge
            .on_tool_result(ToolResultPayload {
                call_id,
                ok: true,
                content: "sunny".into(),
                error: None,
            })
            .unwrap();
        let result = caller.await.unwrap().unwrap();
        assert_eq!(result.content, "sunny");
        assert_eq!(bridge.pending_tool_calls(), 0);
    }

    #[tokio::test]
    async fn failed_tool_result_is_execution_error() {
        let (bridge, mut events) = HostBridge::new();
        let bridge = Arc::new(bridge);
        let caller = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .call_tool(
                        "ext",
                        ToolCallCommand {
                            name: "t".into(),
                            arguments: serde_json::Value::Null,
                        },
                    )
                    .await
            }
        });
        let event = events.recv().await.unwrap();
        let call_id = event.payload["call_id"].as_str().unwrap().to_owned();
        bridge
            .on_tool_result(ToolResultPayload {
                call_id,
                ok: false,
                content: String::new(),
                error: Some("offline".into()),
            })
            .unwrap();
        assert!(matches!(
            caller.await.unwrap(),
            Err(AgentError::ToolExecution(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tool_result_is_rejected() {
        let (bridge, _events) = HostBridge::new();
        let err = bridge
            .on_tool_result(ToolResultPayload {
                call_id: "nope".into(),
                ok: true,
                content: String::new(),
                error: None,
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::Contract(_)));
    }

    #[tokio::test]
    async fn dropped_tool_call_is_forgotten() {
        let (bridge, _events) = HostBridge::new();
        {
            let call = bridge.call_tool(
                "ext",
                ToolCallCommand {
                    name: "t".into(),
                    arguments: serde_json::Value::Null,
                },
            );
            let _ = tokio::time::timeout(std::time::Duration::from_millis(10), call).await;
        }
        assert_eq!(bridge.pending_tool_calls(), 0);
    }
}
