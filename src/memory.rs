//! Long-term conversation memory.
//!
//! A [`MemoryStore`] keeps conversations across sessions and hands back a
//! summary at startup. [`Memorizer`] ties a store to the running engine:
//! it preloads the summary into the context and periodically ships the
//! user/assistant exchange to the store in the background.
//!
//! [`FileMemoryStore`] keeps everything under one directory so it is easy to
//! inspect and edit by hand:
//!
//! ```text
//! <store_dir>/summary.md            hand-editable summary, preferred when present
//! <store_dir>/conversations.jsonl   one memorized conversation per line
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::MemoryConfig;
use crate::error::{AgentError, Result};
use crate::llm::context::{ContextMessage, Role};
use crate::llm::engine::ModelEngine;

/// Prefix of the assistant message carrying the preloaded summary.
pub const SUMMARY_PREFIX: &str = "Memory summary of previous conversations:\n\n";

/// Number of recent lines used when no summary file exists.
const RECENT_FALLBACK_LINES: usize = 10;

/// Who the memorized conversation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryIdentity {
    pub user_id: String,
    pub user_name: String,
    pub agent_id: String,
    pub agent_name: String,
}

impl From<&MemoryConfig> for MemoryIdentity {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            user_name: config.user_name.clone(),
            agent_id: config.agent_id.clone(),
            agent_name: config.agent_name.clone(),
        }
    }
}

/// One line of a memorized conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: Role,
    pub content: String,
}

/// Persistent conversation memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a finished stretch of conversation.
    async fn memorize(&self, conversation: Vec<MemoryMessage>, identity: &MemoryIdentity) -> Result<()>;

    /// Summary of earlier conversations, if any.
    async fn load_summary(&self, identity: &MemoryIdentity) -> Result<Option<String>>;
}

/// User and assistant text of a context snapshot, in order.
pub fn conversation_from_context(messages: &[ContextMessage]) -> Vec<MemoryMessage> {
    messages
        .iter()
        .filter_map(|m| match m {
            ContextMessage::Content { role, text } => Some(MemoryMessage {
                role: *role,
                content: text.clone(),
            }),
            ContextMessage::FunctionCall { .. } | ContextMessage::FunctionCallOutput { .. } => None,
        })
        .collect()
}

/// Drives a [`MemoryStore`] on behalf of the orchestrator.
pub struct Memorizer {
    store: Arc<dyn MemoryStore>,
    identity: MemoryIdentity,
    every_n_turns: u64,
    handle: Handle,
    /// Background writes not yet awaited.
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Memorizer {
    pub fn new(store: Arc<dyn MemoryStore>, config: &MemoryConfig, handle: Handle) -> Self {
        Self {
            store,
            identity: MemoryIdentity::from(config),
            every_n_turns: config.every_n_turns,
            handle,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Whether the turn that just finished should be memorized.
    pub fn is_due(&self, turn_id: u64) -> bool {
        self.every_n_turns > 0 && turn_id > 0 && turn_id % self.every_n_turns == 0
    }

    /// Ship a context snapshot to the store in the background.
    ///
    /// Returns `false` when the snapshot holds no user or assistant text.
    /// The write is tracked until [`wait_idle`](Self::wait_idle) collects it.
    pub fn memorize(&self, snapshot: Vec<ContextMessage>) -> bool {
        let conversation = conversation_from_context(&snapshot);
        if conversation.is_empty() {
            return false;
        }
        let store = Arc::clone(&self.store);
        let identity = self.identity.clone();
        debug!(messages = conversation.len(), user_id = %identity.user_id, "memorizing conversation");
        let task = self.handle.spawn(async move {
            if let Err(e) = store.memorize(conversation, &identity).await {
                error!(error = %e, "failed to memorize conversation");
            }
        });
        let mut pending = self.lock_pending();
        pending.retain(|t| !t.is_finished());
        pending.push(task);
        true
    }

    /// Wait for every background write started so far.
    pub async fn wait_idle(&self) {
        let tasks = std::mem::take(&mut *self.lock_pending());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "memorize task failed");
            }
        }
    }

    /// Background writes still tracked.
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the engine context with the stored summary, if there is one.
    ///
    /// Returns whether a summary was loaded.
    pub async fn preload(&self, engine: &ModelEngine) -> Result<bool> {
        let Some(summary) = self.store.load_summary(&self.identity).await? else {
            return Ok(false);
        };
        if summary.trim().is_empty() {
            return Ok(false);
        }
        engine.clear_context();
        engine.write_context(Role::Assistant, format!("{SUMMARY_PREFIX}{summary}"));
        info!(chars = summary.len(), "memory summary loaded into context");
        Ok(true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConversationRecord {
    ts: i64,
    #[serde(flatten)]
    identity: MemoryIdentity,
    conversation: Vec<MemoryMessage>,
}

/// Directory-backed [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct FileMemoryStore {
    root: PathBuf,
}

impl FileMemoryStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn summary_path(&self) -> PathBuf {
        self.root.join("summary.md")
    }

    fn conversations_path(&self) -> PathBuf {
        self.root.join("conversations.jsonl")
    }

    async fn recent_lines(&self, identity: &MemoryIdentity) -> Result<Vec<String>> {
        let path = self.conversations_path();
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let record: ConversationRecord = serde_json::from_str(line)
                .map_err(|e| AgentError::Memory(format!("invalid conversation record: {e}")))?;
            if record.identity.user_id != identity.user_id {
                continue;
            }
            lines.extend(
                record
                    .conversation
                    .into_iter()
                    .map(|m| format!("- {}: {}", m.role, m.content)),
            );
        }
        let skip = lines.len().saturating_sub(RECENT_FALLBACK_LINES);
        Ok(lines.split_off(skip))
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn memorize(&self, conversation: Vec<MemoryMessage>, identity: &MemoryIdentity) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let record = ConversationRecord {
            ts: chrono::Utc::now().timestamp_millis(),
            identity: identity.clone(),
            conversation,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| AgentError::Memory(format!("failed to serialize conversation: {e}")))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.conversations_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_summary(&self, identity: &MemoryIdentity) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.summary_path()).await {
            Ok(body) if !body.trim().is_empty() => return Ok(Some(body.trim().to_owned())),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let recent = self.recent_lines(identity).await?;
        if recent.is_empty() {
            return Ok(None);
        }
        Ok(Some(recent.join("\n")))
    }
}
