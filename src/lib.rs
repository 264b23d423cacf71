//! Cadence: turn-taking and streaming-response orchestration for real-time
//! voice agents.
//!
//! # Architecture
//!
//! Events from the surrounding runtime flow through two ordered lanes into a
//! static handler table:
//! - **Speech Lane**: speech-recognition results, in arrival order
//! - **Model-Response Lane**: streamed model output, flushable on barge-in
//! - **Dispatcher**: delivers each event to the handlers registered for it
//! - **Model engine**: one request at a time, with a bounded tool-call loop
//! - **Interrupt coordinator**: drops queued and in-flight output when the
//!   user talks over the assistant
//!
//! Synthesis, transcripts, tool execution and the model itself are reached
//! through the [`outbound::Outbound`] and [`llm::transport::ModelTransport`]
//! traits; [`host`] implements both over a JSON-lines stdio protocol.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod host;
pub mod interrupt;
pub mod lane;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod outbound;
pub mod turn;

#[doc(hidden)]
pub mod test_utils;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use events::{AgentEvent, ModelResponse, ResponseKind, SpeechResult, ToolMetadata};
pub use orchestrator::{InboundCommand, Orchestrator};
