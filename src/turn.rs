//! Turn-taking handlers.
//!
//! [`TurnController`] is the handler registered on the dispatcher. It decides
//! when the user has finished speaking, forwards finished utterances to the
//! engine, triggers barge-in, and turns streamed model output into sentences
//! for the synthesizer and lines for the transcript sink.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::EventHandler;
use crate::error::Result;
use crate::events::{AgentEvent, ModelResponse, ResponseKind, SpeechResult, ToolMetadata};
use crate::interrupt::InterruptCoordinator;
use crate::llm::context::Role;
use crate::llm::engine::ModelEngine;
use crate::memory::Memorizer;
use crate::outbound::{Outbound, SynthesisInput, TranscriptMessage};

/// Split `fragment + delta` into complete sentences and a remainder.
///
/// CJK terminators and newlines end a sentence immediately. `. ! ?` only do
/// when followed by whitespace, so `3.5` split across two deltas survives.
/// Whitespace-only sentences are dropped.
///
/// ```
/// let (sentences, rest) = cadence::turn::split_sentences("Hello", " there. How are");
/// assert_eq!(sentences, vec!["Hello there."]);
/// assert_eq!(rest, "How are");
/// ```
pub fn split_sentences(fragment: &str, delta: &str) -> (Vec<String>, String) {
    let text = format!("{fragment}{delta}");
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '。' | '！' | '？' | '\n' => true,
            '.' | '!' | '?' => chars.peek().is_some_and(|(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
            start = end;
        }
    }
    let rest = text[start..].trim_start().to_owned();
    (sentences, rest)
}

/// Text received from the model that does not yet form a full sentence.
///
/// Shared between the turn handlers and the interrupt coordinator.
#[derive(Clone, Default)]
pub struct SentenceFragment(Arc<Mutex<String>>);

impl SentenceFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn get(&self) -> String {
        self.lock().clone()
    }

    /// Append `delta` and return the sentences it completed.
    pub fn push(&self, delta: &str) -> Vec<String> {
        let mut fragment = self.lock();
        let (sentences, rest) = split_sentences(&fragment, delta);
        *fragment = rest;
        sentences
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Conversation bookkeeping for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnState {
    /// Incremented once per final, non-empty speech result acted upon.
    pub turn_id: u64,
    pub session_id: String,
    pub user_count: u32,
}

/// The turn-taking handler set.
pub struct TurnController {
    config: AgentConfig,
    state: Mutex<TurnState>,
    fragment: SentenceFragment,
    engine: ModelEngine,
    interrupt: Arc<InterruptCoordinator>,
    outbound: Arc<dyn Outbound>,
    memorizer: Option<Arc<Memorizer>>,
}

impl TurnController {
    pub fn new(
        config: AgentConfig,
        engine: ModelEngine,
        interrupt: Arc<InterruptCoordinator>,
        outbound: Arc<dyn Outbound>,
        memorizer: Option<Arc<Memorizer>>,
    ) -> Self {
        let state = TurnState {
            turn_id: 0,
            session_id: config.default_session_id.clone(),
            user_count: 0,
        };
        Self {
            fragment: interrupt.fragment(),
            config,
            state: Mutex::new(state),
            engine,
            interrupt,
            outbound,
            memorizer,
        }
    }

    pub fn state(&self) -> TurnState {
        self.lock_state().clone()
    }

    async fn on_user_joined(&self) -> Result<()> {
        let user_count = {
            let mut state = self.lock_state();
            state.user_count += 1;
            state.user_count
        };
        info!(user_count, "user joined");
        if user_count != 1 || self.config.greeting.is_empty() {
            return Ok(());
        }
        let greeting = self.config.greeting.clone();
        let (turn_id, session_id) = self.turn_and_session();
        self.outbound
            .send_synthesis(SynthesisInput::for_turn(turn_id, session_id, &greeting, true))
            .await?;
        self.outbound
            .send_transcript(TranscriptMessage::spoken(
                Role::Assistant,
                greeting,
                true,
                self.config.assistant_stream_id,
            ))
            .await
    }

    fn on_user_left(&self) {
        let mut state = self.lock_state();
        state.user_count = state.user_count.saturating_sub(1);
        info!(user_count = state.user_count, "user left");
    }

    fn on_tool_register(&self, tool: &ToolMetadata, source: &str) {
        self.engine.register_tool(tool.clone(), source);
    }

    async fn on_speech_result(&self, result: &SpeechResult) -> Result<()> {
        let session_id = result
            .session_id()
            .unwrap_or_else(|| self.config.default_session_id.clone());
        self.lock_state().session_id.clone_from(&session_id);
        if result.text.is_empty() {
            return Ok(());
        }

        if result.is_final || result.text.chars().count() > self.config.interrupt_min_chars {
            self.interrupt.interrupt().await;
        }
        if result.is_final {
            let turn_id = {
                let mut state = self.lock_state();
                state.turn_id += 1;
                state.turn_id
            };
            info!(turn_id, %session_id, "user turn finished");
            self.engine.queue_input(result.text.clone());
        }

        let stream_id = session_id.parse::<i64>().unwrap_or_else(|_| {
            warn!(%session_id, "non-numeric session id, using stream 0");
            0
        });
        self.outbound
            .send_transcript(TranscriptMessage::spoken(
                Role::User,
                result.text.clone(),
                result.is_final,
                stream_id,
            ))
            .await
    }

    async fn on_model_response(&self, response: &ModelResponse) -> Result<()> {
        let stream_id = self.config.assistant_stream_id;
        match response.kind {
            ResponseKind::Message => {
                let (turn_id, session_id) = self.turn_and_session();
                if response.is_final {
                    let remaining = self.fragment.take();
                    self.outbound
                        .send_synthesis(SynthesisInput::for_turn(turn_id, session_id, remaining, true))
                        .await?;
                    self.maybe_memorize(turn_id);
                } else {
                    for sentence in self.fragment.push(&response.delta) {
                        self.outbound
                            .send_synthesis(SynthesisInput::for_turn(
                                turn_id,
                                session_id.clone(),
                                sentence,
                                false,
                            ))
                            .await?;
                    }
                }
                self.outbound
                    .send_transcript(TranscriptMessage::spoken(
                        Role::Assistant,
                        response.text.clone(),
                        response.is_final,
                        stream_id,
                    ))
                    .await
            }
            ResponseKind::Reasoning => {
                self.outbound
                    .send_transcript(TranscriptMessage::reasoning(
                        &response.text,
                        response.is_final,
                        stream_id,
                    ))
                    .await
            }
        }
    }

    fn maybe_memorize(&self, turn_id: u64) {
        let Some(memorizer) = &self.memorizer else {
            return;
        };
        if memorizer.is_due(turn_id) {
            debug!(turn_id, "turn due for memorization");
            memorizer.memorize(self.engine.context_snapshot());
        }
    }

    fn turn_and_session(&self) -> (u64, String) {
        let state = self.lock_state();
        (state.turn_id, state.session_id.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventHandler for TurnController {
    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        match event {
            AgentEvent::UserJoined => self.on_user_joined().await,
            AgentEvent::UserLeft => {
                self.on_user_left();
                Ok(())
            }
            AgentEvent::ToolRegister { tool, source } => {
                self.on_tool_register(tool, source);
                Ok(())
            }
            AgentEvent::SpeechResult(result) => self.on_speech_result(result).await,
            AgentEvent::ModelResponse(response) => self.on_model_response(response).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_followed_by_space() {
        let (sentences, rest) = split_sentences("", "One. Two! Three? Four");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?"]);
        assert_eq!(rest, "Four");
    }

    #[test]
    fn trailing_terminator_waits_for_next_delta() {
        let (sentences, rest) = split_sentences("", "It costs 3.");
        assert!(sentences.is_empty());
        assert_eq!(rest, "It costs 3.");

        let (sentences, rest) = split_sentences(&rest, "5 dollars. Ok");
        assert_eq!(sentences, vec!["It costs 3.5 dollars."]);
        assert_eq!(rest, "Ok");
    }

    #[test]
    fn cjk_and_newline_split_immediately() {
        let (sentences, rest) = split_sentences("", "你好。今天怎么样？好\n的");
        assert_eq!(sentences, vec!["你好。", "今天怎么样？", "好"]);
        assert_eq!(rest, "的");
    }

    #[test]
    fn whitespace_only_sentences_are_dropped() {
        let (sentences, rest) = split_sentences("", "\n\n  \nHi.\n");
        assert_eq!(sentences, vec!["Hi."]);
        assert!(rest.is_empty());
    }

    #[test]
    fn fragment_accumulates_across_pushes() {
        let fragment = SentenceFragment::new();
        assert!(fragment.push("Hel").is_empty());
        assert!(fragment.push("lo").is_empty());
        assert_eq!(fragment.push(" world. And"), vec!["Hello world."]);
        assert_eq!(fragment.get(), "And");
        assert_eq!(fragment.take(), "And");
        assert!(fragment.get().is_empty());
    }
}
