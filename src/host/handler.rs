//! Host command handler.
//!
//! [`HostSession`] owns an [`Orchestrator`] whose collaborators are all
//! reached through one [`HostBridge`], and turns each validated
//! [`CommandEnvelope`] into a [`ResponseEnvelope`].

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::bridge::HostBridge;
use super::contract::{
    CommandEnvelope, CommandName, EventEnvelope, ModelChunkPayload, ModelEndPayload,
    ResponseEnvelope, SpeechResultPayload, ToolRegisterPayload, ToolResultPayload,
};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::transport::ModelTransport;
use crate::memory::MemoryStore;
use crate::orchestrator::{InboundCommand, Orchestrator};
use crate::outbound::Outbound;

/// One orchestrator driven by host commands.
pub struct HostSession {
    orchestrator: Orchestrator,
    bridge: Arc<HostBridge>,
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("open_requests", &self.bridge.open_requests())
            .field("pending_tool_calls", &self.bridge.pending_tool_calls())
            .finish()
    }
}

impl HostSession {
    /// Start an orchestrator wired to a fresh bridge.
    ///
    /// Returns the session and the receiver of every event it emits.
    pub async fn start(
        config: AgentConfig,
        memory: Option<Arc<dyn MemoryStore>>,
        handle: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (bridge, events) = HostBridge::new();
        let bridge = Arc::new(bridge);
        let orchestrator = Orchestrator::start(
            config,
            Arc::clone(&bridge) as Arc<dyn Outbound>,
            Arc::clone(&bridge) as Arc<dyn ModelTransport>,
            memory,
            handle,
        )
        .await;
        (
            Self {
                orchestrator,
                bridge,
            },
            events,
        )
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Handle one command. Never fails: every error becomes an error
    /// response carrying the envelope's request id.
    pub async fn handle(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id.clone();
        match self.route(&envelope).await {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload),
            Err(e) => {
                warn!(
                    %request_id,
                    command = envelope.command.as_str(),
                    error = %e,
                    "host command failed"
                );
                ResponseEnvelope::error(request_id, e.to_string())
            }
        }
    }

    async fn route(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        envelope.validate()?;
        match envelope.command {
            CommandName::UserJoined => {
                self.orchestrator.on_command(InboundCommand::UserJoined).await?;
            }
            CommandName::UserLeft => {
                self.orchestrator.on_command(InboundCommand::UserLeft).await?;
            }
            CommandName::ToolRegister => {
                let ToolRegisterPayload { tool, source } = envelope.parse_payload()?;
                self.orchestrator
                    .on_command(InboundCommand::ToolRegister { tool, source })
                    .await?;
            }
            CommandName::SpeechResult => {
                let result: SpeechResultPayload = envelope.parse_payload()?;
                self.orchestrator.on_speech_result(result);
            }
            CommandName::ModelChunk => {
                let payload: ModelChunkPayload = envelope.parse_payload()?;
                self.bridge.on_model_chunk(payload);
            }
            CommandName::ModelEnd => {
                let payload: ModelEndPayload = envelope.parse_payload()?;
                self.bridge.on_model_end(payload);
            }
            CommandName::ToolResult => {
                let payload: ToolResultPayload = envelope.parse_payload()?;
                self.bridge.on_tool_result(payload)?;
            }
            CommandName::RuntimeStop => {
                info!("runtime.stop received");
                self.orchestrator.stop().await;
                return Ok(serde_json::json!({ "stopped": true }));
            }
        }
        Ok(serde_json::json!({ "accepted": true }))
    }

    /// Stop the orchestrator. Idempotent.
    pub async fn stop(&self) {
        self.orchestrator.stop().await;
    }
}
