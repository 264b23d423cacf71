//! Shared test doubles for unit and integration tests.
//!
//! Recording implementations of the collaborator traits, plus a transport
//! that replays scripted chunk sequences.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::events::ModelResponse;
use crate::llm::engine::ResponseSink;
use crate::llm::transport::{ChatCompletionRequest, ChunkStream, ModelChunk, ModelTransport};
use crate::memory::{MemoryIdentity, MemoryMessage, MemoryStore};
use crate::outbound::{
    Outbound, SynthesisFlush, SynthesisInput, ToolCallCommand, ToolCallResult, TranscriptMessage,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `check` every few milliseconds until it holds, for at most two seconds.
///
/// # Panics
///
/// Panics if the condition does not hold in time.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One side effect observed by [`RecordingOutbound`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    Transcript(TranscriptMessage),
    Synthesis(SynthesisInput),
    FlushSynthesis(SynthesisFlush),
    FlushAudio,
    ToolCall(String, ToolCallCommand),
}

/// [`Outbound`] that records every call in order.
pub struct RecordingOutbound {
    calls: Mutex<Vec<OutboundCall>>,
    tool_result: Mutex<Option<Result<ToolCallResult>>>,
    tool_delay: Mutex<Duration>,
}

impl Default for RecordingOutbound {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            tool_result: Mutex::new(None),
            tool_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Result returned by every subsequent tool call. Defaults to an
    /// execution error.
    pub fn set_tool_result(&self, result: Result<ToolCallResult>) {
        *lock(&self.tool_result) = Some(result);
    }

    /// Make tool calls take `delay` before answering.
    pub fn set_tool_delay(&self, delay: Duration) {
        *lock(&self.tool_delay) = delay;
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        lock(&self.calls).clone()
    }

    pub fn transcripts(&self) -> Vec<TranscriptMessage> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OutboundCall::Transcript(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn synthesis(&self) -> Vec<SynthesisInput> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OutboundCall::Synthesis(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<(String, ToolCallCommand)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OutboundCall::ToolCall(source, cmd) => Some((source, cmd)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: OutboundCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send_transcript(&self, message: TranscriptMessage) -> Result<()> {
        self.record(OutboundCall::Transcript(message));
        Ok(())
    }

    async fn send_synthesis(&self, input: SynthesisInput) -> Result<()> {
        self.record(OutboundCall::Synthesis(input));
        Ok(())
    }

    async fn flush_synthesis(&self, flush: SynthesisFlush) -> Result<()> {
        self.record(OutboundCall::FlushSynthesis(flush));
        Ok(())
    }

    async fn flush_audio(&self) -> Result<()> {
        self.record(OutboundCall::FlushAudio);
        Ok(())
    }

    async fn call_tool(&self, source: &str, command: ToolCallCommand) -> Result<ToolCallResult> {
        self.record(OutboundCall::ToolCall(source.to_owned(), command));
        let delay = *lock(&self.tool_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.tool_result).as_ref() {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(e)) => Err(AgentError::ToolExecution(e.to_string())),
            None => Err(AgentError::ToolExecution("no tool result scripted".into())),
        }
    }
}

/// A scripted model reply.
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: Vec<ModelChunk>,
    delay: Duration,
    hold_open: bool,
    fail: Option<String>,
}

impl Script {
    pub fn chunks(chunks: Vec<ModelChunk>) -> Self {
        Self {
            chunks,
            ..Self::default()
        }
    }

    /// Pause before every chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the stream open after the last chunk until it is dropped.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// End the stream with a transport error after the last chunk.
    pub fn fail_with(mut self, reason: impl Into<String>) -> Self {
        self.fail = Some(reason.into());
        self
    }
}

/// [`ModelTransport`] replaying [`Script`]s in order. A request with no
/// script left gets an empty stream.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
    aborted: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        lock(&self.aborted).clone()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        lock(&self.requests).push(request);
        let Script {
            chunks,
            delay,
            hold_open,
            fail,
        } = lock(&self.scripts).pop_front().unwrap_or_default();
        let stream = async_stream::stream! {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(reason) = fail {
                yield Err(AgentError::Transport(reason));
            } else if hold_open {
                std::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn abort(&self, request_id: &str) -> Result<()> {
        lock(&self.aborted).push(request_id.to_owned());
        Ok(())
    }
}

/// [`ResponseSink`] that records responses instead of dispatching them.
#[derive(Default)]
pub struct RecordingSink {
    responses: Mutex<Vec<ModelResponse>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<ModelResponse> {
        lock(&self.responses).clone()
    }

    pub async fn wait_for_count(&self, count: usize) {
        wait_until("model responses", || lock(&self.responses).len() >= count).await;
    }

    pub async fn wait_for_final(&self) {
        wait_until("final model response", || {
            lock(&self.responses).iter().any(|r| r.is_final)
        })
        .await;
    }
}

impl ResponseSink for RecordingSink {
    fn push_response(&self, response: ModelResponse) {
        lock(&self.responses).push(response);
    }
}

/// In-memory [`MemoryStore`].
#[derive(Default)]
pub struct InMemoryStore {
    summary: Mutex<Option<String>>,
    memorized: Mutex<Vec<(Vec<MemoryMessage>, MemoryIdentity)>>,
    delay: Mutex<Duration>,
}

impl InMemoryStore {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Mutex::new(Some(summary.into())),
            ..Self::default()
        }
    }

    /// Make every memorize call take `delay` before it is recorded.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn memorized(&self) -> Vec<(Vec<MemoryMessage>, MemoryIdentity)> {
        lock(&self.memorized).clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn memorize(&self, conversation: Vec<MemoryMessage>, identity: &MemoryIdentity) -> Result<()> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.memorized).push((conversation, identity.clone()));
        Ok(())
    }

    async fn load_summary(&self, _identity: &MemoryIdentity) -> Result<Option<String>> {
        Ok(lock(&self.summary).clone())
    }
}

/// Shorthand for building shared doubles.
pub fn doubles() -> (Arc<RecordingOutbound>, Arc<ScriptedTransport>) {
    (
        Arc::new(RecordingOutbound::new()),
        Arc::new(ScriptedTransport::new()),
    )
}
