//! Registry of tools that external collaborators expose to the model.
//!
//! Tools are owned by whoever registered them; the registry only remembers
//! which collaborator (`source`) receives the call for each tool name.

use std::collections::HashMap;

use tracing::debug;

use crate::events::ToolMetadata;

/// A registered tool and the collaborator that executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTool {
    pub metadata: ToolMetadata,
    pub source: String,
}

/// Name → tool lookup with deterministic schema export.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, metadata: ToolMetadata, source: impl Into<String>) {
        let source = source.into();
        debug!(tool = %metadata.name, %source, "tool registered");
        self.tools.insert(
            metadata.name.clone(),
            RegisteredTool { metadata, source },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for a model request, sorted by name.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        let mut tools: Vec<&RegisteredTool> = self.tools.values().collect();
        tools.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        tools.into_iter().map(|t| t.metadata.to_definition()).collect()
    }
}
