//! Classifies streamed [`ModelChunk`]s into engine actions.
//!
//! [`ResponseStream`] keeps the text of the assistant message currently being
//! streamed so that a request cut short can still be finalized with whatever
//! was already produced.
//!
//! ```
//! use cadence::llm::stream::{ResponseStream, StreamAction};
//! use cadence::llm::transport::ModelChunk;
//!
//! let mut stream = ResponseStream::new();
//! stream.classify(ModelChunk::MessageDelta { delta: "Hel".into(), text: "Hel".into() });
//! stream.classify(ModelChunk::MessageDelta { delta: "lo".into(), text: String::new() });
//! let done = stream.finish_partial().expect("open message");
//! assert_eq!(done.text, "Hello");
//! assert!(done.is_final);
//! ```

use tracing::warn;

use super::transport::ModelChunk;
use crate::events::{ModelResponse, ResponseKind};

/// A tool call parsed out of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub call_id: String,
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// What the engine should do with one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    /// Raise the response and store its text as the assistant message.
    Message(ModelResponse),
    /// Raise the response; reasoning never enters the context.
    Reasoning(ModelResponse),
    ToolCall(PendingToolCall),
    /// Nothing to raise.
    Skip,
}

/// Per-request stream state.
#[derive(Debug, Default)]
pub struct ResponseStream {
    message: String,
    message_open: bool,
    reasoning: String,
}

impl ResponseStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of the assistant message streamed so far.
    pub fn current_text(&self) -> &str {
        &self.message
    }

    pub fn classify(&mut self, chunk: ModelChunk) -> StreamAction {
        match chunk {
            ModelChunk::MessageDelta { delta, text } => {
                accumulate(&mut self.message, &delta, text);
                self.message_open = true;
                if delta.is_empty() {
                    return StreamAction::Skip;
                }
                StreamAction::Message(ModelResponse {
                    delta,
                    text: self.message.clone(),
                    is_final: false,
                    kind: ResponseKind::Message,
                })
            }
            ModelChunk::MessageDone { text } => {
                let text = if text.is_empty() {
                    std::mem::take(&mut self.message)
                } else {
                    self.message.clear();
                    text
                };
                self.message_open = false;
                if text.is_empty() {
                    return StreamAction::Skip;
                }
                StreamAction::Message(ModelResponse {
                    delta: String::new(),
                    text,
                    is_final: true,
                    kind: ResponseKind::Message,
                })
            }
            ModelChunk::ReasoningDelta { delta, text } => {
                accumulate(&mut self.reasoning, &delta, text);
                if delta.is_empty() {
                    return StreamAction::Skip;
                }
                StreamAction::Reasoning(ModelResponse {
                    delta,
                    text: self.reasoning.clone(),
                    is_final: false,
                    kind: ResponseKind::Reasoning,
                })
            }
            ModelChunk::ReasoningDone { text } => {
                let text = if text.is_empty() {
                    std::mem::take(&mut self.reasoning)
                } else {
                    self.reasoning.clear();
                    text
                };
                if text.is_empty() {
                    return StreamAction::Skip;
                }
                StreamAction::Reasoning(ModelResponse {
                    delta: String::new(),
                    text,
                    is_final: true,
                    kind: ResponseKind::Reasoning,
                })
            }
            ModelChunk::ToolCall {
                call_id,
                id,
                name,
                arguments,
            } => StreamAction::ToolCall(PendingToolCall {
                call_id,
                id,
                name,
                arguments,
            }),
            ModelChunk::Unknown => {
                warn!("ignoring unrecognised model chunk");
                StreamAction::Skip
            }
        }
    }

    /// Close an unfinished assistant message as if the model had finished it.
    ///
    /// Returns `None` when no message is open or nothing was produced.
    pub fn finish_partial(&mut self) -> Option<ModelResponse> {
        if !self.message_open {
            return None;
        }
        self.message_open = false;
        let text = std::mem::take(&mut self.message);
        if text.is_empty() {
            return None;
        }
        Some(ModelResponse {
            delta: String::new(),
            text,
            is_final: true,
            kind: ResponseKind::Message,
        })
    }
}

/// Transports may send the full text so far, or only the delta.
fn accumulate(buffer: &mut String, delta: &str, text: String) {
    if text.is_empty() {
        buffer.push_str(delta);
    } else {
        *buffer = text;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    fn delta(d: &str, t: &str) -> ModelChunk {
        ModelChunk::MessageDelta {
            delta: d.into(),
            text: t.into(),
        }
    }

    #[test]
    fn message_deltas_carry_full_text() {
        let mut stream = ResponseStream::new();
        stream.classify(delta("Hi", "Hi"));
        let StreamAction::Message(resp) = stream.classify(delta(" there", "Hi there")) else {
            panic!("expected message");
        };
        assert_eq!(resp.delta, " there");
        assert_eq!(resp.text, "Hi there");
        assert!(!resp.is_final);
        assert_eq!(stream.current_text(), "Hi there");
    }

    #[test]
    fn done_closes_message() {
        let mut stream = ResponseStream::new();
        stream.classify(delta("Hi", "Hi"));
        let action = stream.classify(ModelChunk::MessageDone { text: "Hi".into() });
        assert!(matches!(action, StreamAction::Message(ref r) if r.is_final && r.text == "Hi"));
        assert!(stream.finish_partial().is_none());
    }

    #[test]
    fn empty_delta_and_done_are_skipped() {
        let mut stream = ResponseStream::new();
        assert_eq!(stream.classify(delta("", "")), StreamAction::Skip);
        assert_eq!(
            stream.classify(ModelChunk::MessageDone { text: String::new() }),
            StreamAction::Skip
        );
    }

    #[test]
    fn reasoning_is_separate_from_message() {
        let mut stream = ResponseStream::new();
        let action = stream.classify(ModelChunk::ReasoningDelta {
            delta: "hmm".into(),
            text: String::new(),
        });
        assert!(matches!(action, StreamAction::Reasoning(ref r) if r.kind == ResponseKind::Reasoning));
        assert!(stream.current_text().is_empty());
        assert!(stream.finish_partial().is_none());
    }

    #[test]
    fn partial_message_is_finalized() {
        let mut stream = ResponseStream::new();
        stream.classify(delta("Half a sent", "Half a sent"));
        let done = stream.finish_partial();
        assert_eq!(done.map(|r| r.text), Some("Half a sent".to_owned()));
        assert!(stream.finish_partial().is_none());
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut stream = ResponseStream::new();
        assert_eq!(stream.classify(ModelChunk::Unknown), StreamAction::Skip);
    }
}
