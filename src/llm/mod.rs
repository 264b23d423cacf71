//! Language model request engine.
//!
//! - [`context`]: conversation history with coalescing appends.
//! - [`transport`]: the wire-level model collaborator.
//! - [`stream`]: classification of streamed chunks.
//! - [`tools`]: the tool registry.
//! - [`engine`]: the request loop tying them together.

pub mod context;
pub mod engine;
pub mod stream;
pub mod tools;
pub mod transport;

pub use engine::{ModelEngine, RequestState, ResponseSink};
pub use transport::{ChatCompletionRequest, ModelChunk, ModelTransport};
