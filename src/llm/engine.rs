//! Model execution engine.
//!
//! Owns the conversation context and the tool registry, turns queued user
//! inputs into streaming model requests and runs the tool-call loop:
//!
//! ```text
//! input ─▶ request ─▶ stream ─▶ ModelResponse ─▶ response sink
//!                        │
//!                        └─▶ tool call ─▶ collaborator ─▶ continuation request
//! ```
//!
//! Exactly one request is current at a time. Every callback compares its
//! request id against the current one, so output of a flushed request never
//! reaches the sink after [`ModelEngine::flush`] returns.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{ContextMessage, ContextStore, Role};
use super::stream::{PendingToolCall, ResponseStream, StreamAction};
use super::tools::ToolRegistry;
use super::transport::{ChatCompletionRequest, ModelParameters, ModelTransport};
use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, ModelResponse, ToolMetadata};
use crate::lane::{LaneQueue, ResponseLane};
use crate::outbound::{Outbound, ToolCallCommand};

/// Receives the model responses raised by the engine.
pub trait ResponseSink: Send + Sync {
    fn push_response(&self, response: ModelResponse);
}

impl ResponseSink for ResponseLane {
    fn push_response(&self, response: ModelResponse) {
        self.push(AgentEvent::ModelResponse(response));
    }
}

/// Lifecycle of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Sent, no chunk received yet.
    Pending,
    Streaming,
    /// Waiting on a collaborator to execute a tool.
    ToolCallPending,
    Completed,
    Aborted,
}

/// How a request ended, from the input loop's point of view.
#[derive(Debug)]
enum RequestOutcome {
    Completed,
    /// Tool calls paired with their outputs, committed as the next
    /// request's input.
    Continue(Vec<ContextMessage>),
    Aborted,
    /// A tool call failed; the turn ends without further output.
    Failed,
}

struct CurrentRequest {
    id: String,
    state: RequestState,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct EngineState {
    /// Bumped by every flush; inputs and continuations from an older epoch
    /// never start a request.
    epoch: u64,
    current: Option<CurrentRequest>,
    stopped: bool,
}

struct Inner {
    config: LlmConfig,
    transport: Arc<dyn ModelTransport>,
    outbound: Arc<dyn Outbound>,
    sink: Arc<dyn ResponseSink>,
    context: Mutex<ContextStore>,
    tools: Mutex<ToolRegistry>,
    inputs: LaneQueue<(u64, String)>,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
    handle: Handle,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct ModelEngine {
    inner: Arc<Inner>,
}

impl ModelEngine {
    /// Create an engine. Call [`spawn`](Self::spawn) to start the input loop.
    pub fn new(
        config: LlmConfig,
        transport: Arc<dyn ModelTransport>,
        outbound: Arc<dyn Outbound>,
        sink: Arc<dyn ResponseSink>,
        shutdown: &CancellationToken,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                outbound,
                sink,
                context: Mutex::new(ContextStore::new()),
                tools: Mutex::new(ToolRegistry::new()),
                inputs: LaneQueue::new(),
                state: Mutex::new(EngineState::default()),
                shutdown: shutdown.child_token(),
                handle,
            }),
        }
    }

    /// Start the input loop. It handles one input (and its tool
    /// continuations) at a time and exits on [`stop`](Self::stop).
    pub fn spawn(&self) -> JoinHandle<()> {
        let engine = self.clone();
        self.inner.handle.spawn(async move {
            loop {
                let (epoch, text) = tokio::select! {
                    () = engine.inner.shutdown.cancelled() => break,
                    item = engine.inner.inputs.pop() => item,
                };
                if engine.lock_state().stopped {
                    break;
                }
                engine.run_turn(epoch, text).await;
            }
            info!("model engine stopped");
        })
    }

    /// Queue user text as the input of a new request.
    pub fn queue_input(&self, text: impl Into<String>) {
        let state = self.lock_state();
        if state.stopped {
            debug!("engine stopped, dropping input");
            return;
        }
        let epoch = state.epoch;
        drop(state);
        self.inner.inputs.push((epoch, text.into()));
    }

    /// Inputs waiting for the input loop.
    pub fn pending_inputs(&self) -> usize {
        self.inner.inputs.len()
    }

    pub fn register_tool(&self, metadata: ToolMetadata, source: impl Into<String>) {
        let source = source.into();
        let mut tools = self.lock_tools();
        if let Some(existing) = tools.get(&metadata.name)
            && existing.source != source
        {
            info!(tool = %metadata.name, old = %existing.source, new = %source, "tool owner replaced");
        }
        tools.register(metadata, source);
    }

    /// Whether a tool with `name` is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.lock_tools().exists(name)
    }

    /// Append a content message to the context (coalescing rules apply).
    pub fn write_context(&self, role: Role, text: impl Into<String>) {
        self.lock_context().append(ContextMessage::content(role, text));
    }

    pub fn clear_context(&self) {
        self.lock_context().clear();
    }

    /// Owned copy of the context.
    pub fn context_snapshot(&self) -> Vec<ContextMessage> {
        self.lock_context().snapshot()
    }

    pub fn current_request_id(&self) -> Option<String> {
        self.lock_state().current.as_ref().map(|c| c.id.clone())
    }

    pub fn request_state(&self) -> Option<RequestState> {
        self.lock_state().current.as_ref().map(|c| c.state)
    }

    /// Abandon everything in flight.
    ///
    /// Drops queued inputs, asks the transport to abort the current request,
    /// cancels its stream and waits for it to wind down. Safe to call when
    /// idle and safe to call repeatedly.
    pub async fn flush(&self) {
        let current = {
            let mut state = self.lock_state();
            state.epoch += 1;
            let dropped = self.inner.inputs.drain();
            if dropped > 0 {
                debug!(dropped, "dropped queued inputs");
            }
            state
                .current
                .as_ref()
                .map(|c| (c.id.clone(), c.cancel.clone(), c.done.clone()))
        };
        let Some((request_id, cancel, mut done)) = current else {
            return;
        };

        info!(%request_id, "flushing model request");
        if let Err(e) = self.inner.transport.abort(&request_id).await {
            warn!(%request_id, error = %e, "transport abort failed");
        }
        cancel.cancel();
        let _ = done.wait_for(|finished| *finished).await;
        self.clear_current(&request_id);
    }

    /// Flush and refuse further work.
    pub async fn stop(&self) {
        self.lock_state().stopped = true;
        self.flush().await;
        self.inner.shutdown.cancel();
    }

    async fn run_turn(&self, epoch: u64, text: String) {
        let mut next = vec![ContextMessage::user(text)];
        let mut rounds = 0;
        loop {
            let Some(outcome) = self.run_request(epoch, next).await else {
                return;
            };
            match outcome {
                RequestOutcome::Continue(messages) => {
                    rounds += 1;
                    if rounds > self.inner.config.max_tool_rounds {
                        warn!(
                            max_tool_rounds = self.inner.config.max_tool_rounds,
                            "tool continuation limit reached, ending turn"
                        );
                        self.commit(epoch, messages);
                        return;
                    }
                    next = messages;
                }
                RequestOutcome::Completed | RequestOutcome::Aborted | RequestOutcome::Failed => {
                    return;
                }
            }
        }
    }

    /// Run one request to completion. `None` when it was never started
    /// because a flush intervened.
    async fn run_request(&self, epoch: u64, input: Vec<ContextMessage>) -> Option<RequestOutcome> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.inner.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let messages = {
            let mut state = self.lock_state();
            if state.stopped || state.epoch != epoch {
                debug!(messages = input.len(), "dropping input queued before flush");
                return None;
            }
            state.current = Some(CurrentRequest {
                id: request_id.clone(),
                state: RequestState::Pending,
                cancel: cancel.clone(),
                done: done_rx,
            });
            // Committed together with the request so a flush never splits a
            // tool call from its output.
            let mut context = self.lock_context();
            let mut messages = context.snapshot();
            messages.extend(input.iter().cloned());
            for message in input {
                context.append(message);
            }
            messages
        };

        let request = ChatCompletionRequest {
            request_id: request_id.clone(),
            messages,
            tools: self.lock_tools().definitions(),
            model: self.inner.config.model.clone(),
            parameters: ModelParameters::from(&self.inner.config),
        };
        debug!(%request_id, messages = request.messages.len(), "sending chat completion");

        let engine = self.clone();
        let task_id = request_id.clone();
        let task = self.inner.handle.spawn(async move {
            let outcome = engine.stream_request(&task_id, request, &cancel).await;
            let _ = done_tx.send(true);
            outcome
        });
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%request_id, error = %e, "request task failed");
                RequestOutcome::Aborted
            }
        };
        debug!(%request_id, ?outcome, "request finished");
        self.clear_current(&request_id);
        Some(outcome)
    }

    async fn stream_request(
        &self,
        request_id: &str,
        request: ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let mut stream = ResponseStream::new();
        let mut tool_turns = Vec::new();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.drive(request_id, request, &mut stream, &mut tool_turns) => result,
        };

        match result {
            Ok(()) => {
                if let Some(done) = stream.finish_partial() {
                    warn!(%request_id, "transport closed mid-message");
                    discard_tool_turns(request_id, &tool_turns);
                    self.set_state(request_id, RequestState::Aborted);
                    self.raise(request_id, StreamAction::Message(done));
                    return RequestOutcome::Aborted;
                }
                self.set_state(request_id, RequestState::Completed);
                continuation(tool_turns)
            }
            Err(AgentError::ToolExecution(reason)) => {
                warn!(%request_id, %reason, "tool call failed, ending turn");
                discard_tool_turns(request_id, &tool_turns);
                RequestOutcome::Failed
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(%request_id, "request cancelled");
                } else {
                    warn!(%request_id, error = %e, "request aborted");
                }
                discard_tool_turns(request_id, &tool_turns);
                self.set_state(request_id, RequestState::Aborted);
                if let Some(done) = stream.finish_partial() {
                    self.raise(request_id, StreamAction::Message(done));
                }
                RequestOutcome::Aborted
            }
        }
    }

    async fn drive(
        &self,
        request_id: &str,
        request: ChatCompletionRequest,
        stream: &mut ResponseStream,
        tool_turns: &mut Vec<(ContextMessage, ContextMessage)>,
    ) -> Result<()> {
        let mut chunks = self.inner.transport.chat_completion(request).await?;
        self.set_state(request_id, RequestState::Streaming);

        while let Some(chunk) = chunks.next().await {
            match stream.classify(chunk?) {
                StreamAction::ToolCall(call) => {
                    if let Some(turn) = self.execute_tool(request_id, call).await? {
                        tool_turns.push(turn);
                    }
                }
                StreamAction::Skip => {}
                action => self.raise(request_id, action),
            }
        }
        Ok(())
    }

    /// Resolve and run one tool call. Unknown tools are dropped.
    async fn execute_tool(
        &self,
        request_id: &str,
        call: PendingToolCall,
    ) -> Result<Option<(ContextMessage, ContextMessage)>> {
        let source = self
            .lock_tools()
            .get(&call.name)
            .map(|tool| tool.source.clone());
        let Some(source) = source else {
            let e = AgentError::ToolResolution(call.name.clone());
            warn!(%request_id, tool = %call.name, error = %e, "model called an unregistered tool");
            return Ok(None);
        };

        info!(%request_id, tool = %call.name, %source, "invoking tool");
        self.set_state(request_id, RequestState::ToolCallPending);
        let command = ToolCallCommand {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
        let result = self
            .inner
            .outbound
            .call_tool(&source, command)
            .await
            .map_err(|e| match e {
                AgentError::Cancelled | AgentError::ToolExecution(_) => e,
                other => AgentError::ToolExecution(other.to_string()),
            })?;
        self.set_state(request_id, RequestState::Streaming);
        debug!(%request_id, tool = %call.name, "tool returned");

        let arguments = match &call.arguments {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(Some((
            ContextMessage::FunctionCall {
                name: call.name,
                arguments,
                call_id: call.call_id.clone(),
                id: call.id,
            },
            ContextMessage::FunctionCallOutput {
                output: result.content,
                call_id: call.call_id,
            },
        )))
    }

    /// Commit complete tool turns unless a flush has moved past `epoch`.
    fn commit(&self, epoch: u64, messages: Vec<ContextMessage>) {
        let state = self.lock_state();
        if state.epoch != epoch {
            debug!(messages = messages.len(), "dropping tool turns of a flushed request");
            return;
        }
        let mut context = self.lock_context();
        for message in messages {
            context.append(message);
        }
    }

    /// Commit and forward a response if `request_id` is still current.
    fn raise(&self, request_id: &str, action: StreamAction) {
        let state = self.lock_state();
        if state.current.as_ref().map(|c| c.id.as_str()) != Some(request_id) {
            debug!(%request_id, "dropping output of stale request");
            return;
        }
        let response = match action {
            StreamAction::Message(response) => {
                self.lock_context()
                    .append(ContextMessage::assistant(response.text.clone()));
                response
            }
            StreamAction::Reasoning(response) => response,
            StreamAction::ToolCall(_) | StreamAction::Skip => return,
        };
        self.inner.sink.push_response(response);
    }

    fn set_state(&self, request_id: &str, new_state: RequestState) {
        if let Some(current) = self.lock_state().current.as_mut()
            && current.id == request_id
        {
            current.state = new_state;
        }
    }

    fn clear_current(&self, request_id: &str) {
        let mut state = self.lock_state();
        if state.current.as_ref().map(|c| c.id.as_str()) == Some(request_id) {
            state.current = None;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_context(&self) -> MutexGuard<'_, ContextStore> {
        self.inner.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tools(&self) -> MutexGuard<'_, ToolRegistry> {
        self.inner.tools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn continuation(tool_turns: Vec<(ContextMessage, ContextMessage)>) -> RequestOutcome {
    if tool_turns.is_empty() {
        return RequestOutcome::Completed;
    }
    RequestOutcome::Continue(
        tool_turns
            .into_iter()
            .flat_map(|(call, output)| [call, output])
            .collect(),
    )
}

fn discard_tool_turns(request_id: &str, tool_turns: &[(ContextMessage, ContextMessage)]) {
    if !tool_turns.is_empty() {
        debug!(%request_id, tool_turns = tool_turns.len(), "request ended early, discarding tool turns");
    }
}
