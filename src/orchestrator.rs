//! Wires the dispatcher, lanes, engine and turn handlers together.
//!
//! ```text
//! on_speech_result ─▶ Speech Lane ─────────┐
//! on_command ───────▶ (immediate) ─────────┼─▶ Dispatcher ─▶ TurnController
//! engine output ────▶ Model-Response Lane ─┘                    │
//!                                                               ├─▶ ModelEngine
//!                                                               └─▶ Outbound
//! ```

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, DispatcherBuilder, EventFilter, EventHandler};
use crate::error::Result;
use crate::events::{AgentEvent, LaneKind, SpeechResult, ToolMetadata};
use crate::interrupt::InterruptCoordinator;
use crate::lane::{ResponseLane, SpeechLane};
use crate::llm::engine::{ModelEngine, ResponseSink};
use crate::llm::transport::ModelTransport;
use crate::memory::{Memorizer, MemoryStore};
use crate::outbound::Outbound;
use crate::turn::{TurnController, TurnState};

/// Control commands from the hosting runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    UserJoined,
    UserLeft,
    /// Raw tool metadata; validated before it reaches the handlers.
    ToolRegister {
        tool: serde_json::Value,
        source: String,
    },
}

/// One running turn-taking core.
pub struct Orchestrator {
    dispatcher: Dispatcher,
    speech_lane: SpeechLane,
    response_lane: ResponseLane,
    engine: ModelEngine,
    interrupt: Arc<InterruptCoordinator>,
    turn: Arc<TurnController>,
    memorizer: Option<Arc<Memorizer>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component and spawn the lane consumers and the engine
    /// input loop on `handle`.
    ///
    /// When memory is enabled in `config` and a store is given, the stored
    /// summary is loaded into the context before any event is handled. A
    /// failing store is logged and otherwise ignored.
    pub async fn start(
        config: AgentConfig,
        outbound: Arc<dyn Outbound>,
        transport: Arc<dyn ModelTransport>,
        memory: Option<Arc<dyn MemoryStore>>,
        handle: Handle,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let speech_lane = SpeechLane::new();
        let response_lane = ResponseLane::new();

        let engine = ModelEngine::new(
            config.llm.clone(),
            transport,
            Arc::clone(&outbound),
            Arc::new(response_lane.clone()) as Arc<dyn ResponseSink>,
            &shutdown,
            handle.clone(),
        );

        let memorizer = match memory {
            Some(store) if config.memory.enabled => Some(Arc::new(Memorizer::new(
                store,
                &config.memory,
                handle.clone(),
            ))),
            Some(_) => {
                info!("memory store given but memory is disabled");
                None
            }
            None => None,
        };
        if let Some(memorizer) = &memorizer
            && let Err(e) = memorizer.preload(&engine).await
        {
            error!(error = %e, "failed to load memory summary");
        }

        let interrupt = Arc::new(InterruptCoordinator::new(
            engine.clone(),
            response_lane.clone(),
            Arc::clone(&outbound),
        ));
        let turn = Arc::new(TurnController::new(
            config,
            engine.clone(),
            Arc::clone(&interrupt),
            outbound,
            memorizer.clone(),
        ));

        let handler = Arc::clone(&turn) as Arc<dyn EventHandler>;
        let dispatcher = DispatcherBuilder::new()
            .on(EventFilter::Presence, Arc::clone(&handler))
            .on(EventFilter::ToolRegister, Arc::clone(&handler))
            .on(EventFilter::SpeechResult, Arc::clone(&handler))
            .on(EventFilter::ModelResponse, handler)
            .build();

        let tasks = vec![
            speech_lane.spawn(dispatcher.clone(), shutdown.clone(), &handle),
            response_lane.spawn(dispatcher.clone(), shutdown.clone(), &handle),
            engine.spawn(),
        ];
        info!(handlers = dispatcher.handler_count(), "orchestrator started");

        Self {
            dispatcher,
            speech_lane,
            response_lane,
            engine,
            interrupt,
            turn,
            memorizer,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Handle a control command.
    ///
    /// # Errors
    ///
    /// [`AgentError::Config`](crate::error::AgentError::Config) for malformed
    /// tool metadata; nothing is registered in that case.
    pub async fn on_command(&self, command: InboundCommand) -> Result<()> {
        let event = match command {
            InboundCommand::UserJoined => AgentEvent::UserJoined,
            InboundCommand::UserLeft => AgentEvent::UserLeft,
            InboundCommand::ToolRegister { tool, source } => {
                let tool = ToolMetadata::from_json(tool).inspect_err(|e| {
                    warn!(%source, error = %e, "rejecting tool registration");
                })?;
                AgentEvent::ToolRegister { tool, source }
            }
        };
        self.submit(event).await
    }

    /// Queue a speech-recognition result on the Speech Lane.
    pub fn on_speech_result(&self, result: SpeechResult) {
        self.speech_lane.push(AgentEvent::SpeechResult(result));
    }

    /// Route an event by its lane: laned events are queued, the rest are
    /// dispatched before this returns.
    pub async fn submit(&self, event: AgentEvent) -> Result<()> {
        match event.lane() {
            LaneKind::Speech => self.speech_lane.push(event),
            LaneKind::ModelResponse => self.response_lane.push(event),
            LaneKind::Immediate => self.dispatcher.dispatch(&event).await?,
        }
        Ok(())
    }

    pub fn engine(&self) -> &ModelEngine {
        &self.engine
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn.state()
    }

    /// Interrupts run since start.
    pub fn interrupt_count(&self) -> u64 {
        self.interrupt.count()
    }

    /// Events waiting on each lane: `(speech, model_response)`.
    pub fn pending(&self) -> (usize, usize) {
        (self.speech_lane.pending(), self.response_lane.pending())
    }

    /// Stop the engine, drain the response lane, and wait for every spawned
    /// task to exit, background memory writes included.
    pub async fn stop(&self) {
        self.engine.stop().await;
        self.response_lane.flush().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "orchestrator task failed");
            }
        }
        if let Some(memorizer) = &self.memorizer {
            memorizer.wait_idle().await;
        }
        info!("orchestrator stopped");
    }
}
