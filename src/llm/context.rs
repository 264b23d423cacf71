//! Conversation context store.
//!
//! An ordered log of [`ContextMessage`]s. Appending is append-only except for
//! one rule: a [`ContextMessage::Content`] whose role matches the role of the
//! last entry (itself a `Content`) replaces that entry's text. Streaming
//! assistant output relies on this to keep a single assistant entry per
//! message while deltas arrive.
//!
//! # Examples
//!
//! ```
//! use cadence::llm::context::{ContextMessage, ContextStore, Role};
//!
//! let mut store = ContextStore::new();
//! store.append(ContextMessage::content(Role::Assistant, "Hi"));
//! store.append(ContextMessage::content(Role::Assistant, "Hi there"));
//! assert_eq!(store.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

/// Who authored a content message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextMessage {
    /// Plain user or assistant text.
    Content { role: Role, text: String },
    /// A tool call as issued by the model.
    FunctionCall {
        name: String,
        arguments: String,
        call_id: String,
        id: String,
    },
    /// The result returned for a tool call.
    FunctionCallOutput { output: String, call_id: String },
}

impl ContextMessage {
    pub fn content(role: Role, text: impl Into<String>) -> Self {
        Self::Content {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::content(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::content(Role::Assistant, text)
    }

    /// Role of a `Content` entry; `None` for function entries.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Content { role, .. } => Some(*role),
            Self::FunctionCall { .. } | Self::FunctionCallOutput { .. } => None,
        }
    }
}

/// Ordered, coalescing conversation log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStore {
    messages: Vec<ContextMessage>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`, coalescing same-role content into the last entry.
    pub fn append(&mut self, message: ContextMessage) {
        if let ContextMessage::Content { role, text } = &message
            && let Some(ContextMessage::Content {
                role: last_role,
                text: last_text,
            }) = self.messages.last_mut()
            && last_role == role
        {
            last_text.clone_from(text);
            return;
        }
        self.messages.push(message);
    }

    /// Owned copy of the log, safe to hand to background tasks.
    pub fn snapshot(&self) -> Vec<ContextMessage> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[ContextMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_role_content_coalesces() {
        let mut store = ContextStore::new();
        store.append(ContextMessage::assistant("a"));
        store.append(ContextMessage::assistant("b"));
        assert_eq!(store.messages(), &[ContextMessage::assistant("b")]);
    }

    #[test]
    fn different_roles_append() {
        let mut store = ContextStore::new();
        store.append(ContextMessage::assistant("a"));
        store.append(ContextMessage::user("x"));
        store.append(ContextMessage::assistant("b"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn function_entries_never_coalesce() {
        let mut store = ContextStore::new();
        store.append(ContextMessage::assistant("calling"));
        store.append(ContextMessage::FunctionCall {
            name: "lookup".into(),
            arguments: "{}".into(),
            call_id: "c1".into(),
            id: "c1".into(),
        });
        store.append(ContextMessage::FunctionCallOutput {
            output: "42".into(),
            call_id: "c1".into(),
        });
        store.append(ContextMessage::FunctionCallOutput {
            output: "43".into(),
            call_id: "c2".into(),
        });
        // Content after a function entry is a new entry even if the role
        // matches an earlier one.
        store.append(ContextMessage::assistant("done"));
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut store = ContextStore::new();
        store.append(ContextMessage::user("hi"));
        let snapshot = store.snapshot();
        store.append(ContextMessage::assistant("hello"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(ContextMessage::user("hi")).unwrap_or_default();
        assert_eq!(json["type"], "content");
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "hi");
    }
}
