//! End-to-end turn-taking scenarios driven through the public orchestrator API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use cadence::config::AgentConfig;
use cadence::llm::context::{ContextMessage, Role};
use cadence::llm::transport::{ModelChunk, ModelTransport};
use cadence::memory::{MemoryMessage, MemoryStore};
use cadence::orchestrator::{InboundCommand, Orchestrator};
use cadence::outbound::{Outbound, ToolCallResult};
use cadence::test_utils::{
    InMemoryStore, OutboundCall, RecordingOutbound, Script, ScriptedTransport, doubles, wait_until,
};
use cadence::SpeechResult;
use tokio::runtime::Handle;

fn quiet_config() -> AgentConfig {
    AgentConfig {
        greeting: String::new(),
        ..AgentConfig::default()
    }
}

async fn start(
    config: AgentConfig,
    memory: Option<Arc<dyn MemoryStore>>,
) -> (Orchestrator, Arc<RecordingOutbound>, Arc<ScriptedTransport>) {
    let (outbound, transport) = doubles();
    let orchestrator = Orchestrator::start(
        config,
        Arc::clone(&outbound) as Arc<dyn Outbound>,
        Arc::clone(&transport) as Arc<dyn ModelTransport>,
        memory,
        Handle::current(),
    )
    .await;
    (orchestrator, outbound, transport)
}

fn delta(text: &str) -> ModelChunk {
    ModelChunk::MessageDelta {
        delta: text.to_owned(),
        text: String::new(),
    }
}

fn done(text: &str) -> ModelChunk {
    ModelChunk::MessageDone {
        text: text.to_owned(),
    }
}

async fn wait_for_final_reply(outbound: &RecordingOutbound) {
    wait_until("final assistant transcript", || {
        outbound
            .transcripts()
            .iter()
            .any(|t| t.role == Role::Assistant && t.is_final)
    })
    .await;
}

#[tokio::test]
async fn simple_turn_speaks_in_sentences() {
    let (orchestrator, outbound, transport) = start(quiet_config(), None).await;
    transport.push_script(Script::chunks(vec![
        delta("Hello"),
        delta(" there. How"),
        delta(" are you?"),
        done("Hello there. How are you?"),
    ]));

    orchestrator.on_speech_result(SpeechResult::new("hi", true).with_session_id("7"));
    wait_for_final_reply(&outbound).await;

    let synthesis = outbound.synthesis();
    let spoken: Vec<(&str, bool)> = synthesis
        .iter()
        .map(|s| (s.text.as_str(), s.text_input_end))
        .collect();
    assert_eq!(spoken, vec![("Hello there.", false), ("How are you?", true)]);
    assert!(synthesis.iter().all(|s| s.metadata.turn_id == 1));
    assert!(synthesis.iter().all(|s| s.metadata.session_id == "7"));
    assert_eq!(synthesis[0].request_id, "tts-request-1");

    let user = outbound
        .transcripts()
        .into_iter()
        .find(|t| t.role == Role::User)
        .unwrap();
    assert_eq!(user.text, "hi");
    assert_eq!(user.stream_id, 7);
    assert!(user.is_final);

    assert_eq!(
        orchestrator.engine().context_snapshot(),
        vec![
            ContextMessage::user("hi"),
            ContextMessage::assistant("Hello there. How are you?"),
        ]
    );
    assert_eq!(transport.requests().len(), 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn barge_in_drops_in_flight_output() {
    let (orchestrator, outbound, transport) = start(quiet_config(), None).await;
    transport.push_script(
        Script::chunks(vec![
            delta("One. "),
            delta("Two. "),
            delta("Three. "),
            delta("Four. "),
        ])
        .with_delay(Duration::from_millis(30))
        .hold_open(),
    );

    orchestrator.on_speech_result(SpeechResult::new("count for me", true));
    wait_until("first sentence", || !outbound.synthesis().is_empty()).await;

    orchestrator.on_speech_result(SpeechResult::new("stop please", false));
    wait_until("barge-in", || orchestrator.interrupt_count() == 2).await;

    let request_id = transport.requests()[0].request_id.clone();
    assert_eq!(transport.aborted(), vec![request_id]);
    assert_eq!(orchestrator.engine().current_request_id(), None);
    assert_eq!(orchestrator.pending().1, 0);

    let spoken = outbound.synthesis().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(outbound.synthesis().len(), spoken);

    // The second interrupt flushes synthesis before audio.
    let calls = outbound.calls();
    let flushes: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, OutboundCall::FlushSynthesis(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flushes.len(), 2);
    assert_eq!(calls[flushes[1] + 1], OutboundCall::FlushAudio);

    // A non-final result is not a turn.
    assert_eq!(orchestrator.turn_state().turn_id, 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn barge_in_sends_no_synthesis_before_the_flush() {
    let (orchestrator, outbound, transport) = start(quiet_config(), None).await;
    transport.push_script(Script::chunks(vec![delta("One. "), delta("Two")]).hold_open());

    orchestrator.on_speech_result(SpeechResult::new("count", true));
    wait_until("first sentence", || !outbound.synthesis().is_empty()).await;
    let before = outbound.calls().len();

    orchestrator.on_speech_result(SpeechResult::new("stop please", false));
    wait_until("barge-in", || orchestrator.interrupt_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after: Vec<OutboundCall> = outbound.calls().split_off(before);
    let flush = after
        .iter()
        .position(|c| matches!(c, OutboundCall::FlushSynthesis(_)))
        .expect("synthesis flush");
    assert!(
        after[..flush]
            .iter()
            .all(|c| !matches!(c, OutboundCall::Synthesis(_))),
        "synthesis issued during barge-in: {after:?}"
    );
    assert_eq!(after[flush + 1], OutboundCall::FlushAudio);
    assert!(!after.iter().any(|c| matches!(c, OutboundCall::Synthesis(_))));

    let spoken: Vec<String> = outbound.synthesis().into_iter().map(|s| s.text).collect();
    assert_eq!(spoken, vec!["One."]);
    assert!(
        !outbound
            .transcripts()
            .iter()
            .any(|t| t.role == Role::Assistant && t.is_final)
    );
    // What was said before the barge-in stays in the conversation.
    assert_eq!(
        orchestrator.engine().context_snapshot(),
        vec![ContextMessage::user("count"), ContextMessage::assistant("One. Two")]
    );
    orchestrator.stop().await;
}

#[tokio::test]
async fn unknown_tool_is_skipped() {
    let (orchestrator, outbound, transport) = start(quiet_config(), None).await;
    transport.push_script(Script::chunks(vec![ModelChunk::ToolCall {
        call_id: "c1".into(),
        id: "fc1".into(),
        name: "launch_rocket".into(),
        arguments: serde_json::json!({}),
    }]));

    orchestrator.on_speech_result(SpeechResult::new("go", true));
    wait_until("request sent", || transport.requests().len() == 1).await;
    wait_until("request finished", || {
        orchestrator.engine().current_request_id().is_none()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(outbound.tool_calls().is_empty());
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(
        orchestrator.engine().context_snapshot(),
        vec![ContextMessage::user("go")]
    );
    orchestrator.stop().await;
}

#[tokio::test]
async fn tool_round_trip_continues_the_turn() {
    let (orchestrator, outbound, transport) = start(quiet_config(), None).await;
    orchestrator
        .on_command(InboundCommand::ToolRegister {
            tool: serde_json::json!({
                "name": "weather",
                "description": "Current weather",
                "parameters": [{"name": "city", "type": "string", "required": true}],
            }),
            source: "ext-weather".into(),
        })
        .await
        .unwrap();
    outbound.set_tool_result(Ok(ToolCallResult {
        content: "sunny".into(),
    }));
    transport.push_script(Script::chunks(vec![ModelChunk::ToolCall {
        call_id: "c1".into(),
        id: "fc1".into(),
        name: "weather".into(),
        arguments: serde_json::json!({"city": "Oslo"}),
    }]));
    transport.push_script(Script::chunks(vec![delta("It is sunny."), done("It is sunny.")]));

    orchestrator.on_speech_result(SpeechResult::new("weather in Oslo?", true));
    wait_for_final_reply(&outbound).await;

    let calls = outbound.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "ext-weather");
    assert_eq!(calls[0].1.name, "weather");
    assert_eq!(calls[0].1.arguments, serde_json::json!({"city": "Oslo"}));

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(
        requests[1].messages.last(),
        Some(&ContextMessage::FunctionCallOutput {
            output: "sunny".into(),
            call_id: "c1".into(),
        })
    );

    assert_eq!(
        orchestrator.engine().context_snapshot(),
        vec![
            ContextMessage::user("weather in Oslo?"),
            ContextMessage::FunctionCall {
                name: "weather".into(),
                arguments: r#"{"city":"Oslo"}"#.into(),
                call_id: "c1".into(),
                id: "fc1".into(),
            },
            ContextMessage::FunctionCallOutput {
                output: "sunny".into(),
                call_id: "c1".into(),
            },
            ContextMessage::assistant("It is sunny."),
        ]
    );
    orchestrator.stop().await;
}

#[tokio::test]
async fn turn_id_counts_final_non_empty_results() {
    let (orchestrator, outbound, _transport) = start(quiet_config(), None).await;

    orchestrator.on_speech_result(SpeechResult::new("first", true));
    orchestrator.on_speech_result(SpeechResult::new("", true));
    orchestrator.on_speech_result(SpeechResult::new("sec", false));
    orchestrator.on_speech_result(SpeechResult::new("second", true));
    wait_until("two turns", || orchestrator.turn_state().turn_id == 2).await;
    wait_until("user transcripts", || outbound.transcripts().len() == 3).await;

    let texts: Vec<String> = outbound.transcripts().into_iter().map(|t| t.text).collect();
    assert_eq!(texts, vec!["first", "sec", "second"]);
    orchestrator.stop().await;
}

#[tokio::test]
async fn greeting_is_spoken_when_the_room_fills() {
    let (orchestrator, outbound, _transport) = start(AgentConfig::default(), None).await;

    orchestrator.on_command(InboundCommand::UserJoined).await.unwrap();
    orchestrator.on_command(InboundCommand::UserJoined).await.unwrap();
    orchestrator.on_command(InboundCommand::UserLeft).await.unwrap();
    orchestrator.on_command(InboundCommand::UserLeft).await.unwrap();
    orchestrator.on_command(InboundCommand::UserJoined).await.unwrap();

    let synthesis = outbound.synthesis();
    assert_eq!(synthesis.len(), 2);
    assert!(synthesis.iter().all(|s| s.text_input_end));
    assert_eq!(synthesis[0].text, AgentConfig::default().greeting);
    assert_eq!(orchestrator.turn_state().user_count, 1);
    orchestrator.stop().await;
}

#[tokio::test]
async fn completed_turn_is_memorized_from_a_snapshot() {
    let mut config = quiet_config();
    config.memory.enabled = true;
    config.memory.every_n_turns = 1;
    let store = Arc::new(InMemoryStore::default());
    let (orchestrator, outbound, transport) =
        start(config, Some(Arc::clone(&store) as Arc<dyn MemoryStore>)).await;
    transport.push_script(Script::chunks(vec![delta("Hi."), done("Hi.")]));

    orchestrator.on_speech_result(SpeechResult::new("hello", true));
    wait_for_final_reply(&outbound).await;
    wait_until("memorize", || store.memorized().len() == 1).await;

    orchestrator
        .engine()
        .write_context(Role::User, "added after the handoff");
    let (conversation, identity) = store.memorized().remove(0);
    assert_eq!(
        conversation,
        vec![
            MemoryMessage {
                role: Role::User,
                content: "hello".into(),
            },
            MemoryMessage {
                role: Role::Assistant,
                content: "Hi.".into(),
            },
        ]
    );
    assert_eq!(identity.user_id, "user");
    orchestrator.stop().await;
}

#[tokio::test]
async fn stop_waits_for_background_memory_writes() {
    let mut config = quiet_config();
    config.memory.enabled = true;
    config.memory.every_n_turns = 1;
    let store = Arc::new(InMemoryStore::default());
    store.set_delay(Duration::from_millis(200));
    let (orchestrator, outbound, transport) =
        start(config, Some(Arc::clone(&store) as Arc<dyn MemoryStore>)).await;
    transport.push_script(Script::chunks(vec![delta("Bye."), done("Bye.")]));

    orchestrator.on_speech_result(SpeechResult::new("goodbye", true));
    wait_for_final_reply(&outbound).await;
    assert!(store.memorized().is_empty());

    orchestrator.stop().await;
    assert_eq!(store.memorized().len(), 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_ignores_later_input() {
    let (orchestrator, _outbound, transport) = start(quiet_config(), None).await;
    orchestrator.stop().await;
    orchestrator.stop().await;

    orchestrator.engine().queue_input("anyone there?");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.requests().is_empty());
}
