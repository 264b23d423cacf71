//! Configuration types for the turn-taking orchestrator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for one orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Spoken once when the first user joins. Empty disables the greeting.
    pub greeting: String,
    /// A non-final speech result longer than this many characters counts as
    /// barge-in. Final results always do.
    pub interrupt_min_chars: usize,
    /// Session id used when a speech result carries none in its metadata.
    pub default_session_id: String,
    /// Transcript stream id used for assistant output.
    pub assistant_stream_id: i64,
    /// Language model request settings.
    pub llm: LlmConfig,
    /// Long-term conversation memory settings.
    pub memory: MemoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            greeting: "Hello there, I'm your voice assistant".to_owned(),
            interrupt_min_chars: 2,
            default_session_id: "100".to_owned(),
            assistant_stream_id: 100,
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

/// Parameters forwarded to the model transport with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier understood by the transport.
    pub model: String,
    /// Optional system prompt prepended to every request (never stored in context).
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens generated per request.
    pub max_tokens: u32,
    /// Longest chain of tool-call continuations allowed within one turn.
    pub max_tool_rounds: usize,
    /// Free-form provider parameters passed through untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_owned(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 512,
            max_tool_rounds: 8,
            extra: serde_json::Map::new(),
        }
    }
}

/// Conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether completed turns are memorized and the summary preloaded.
    pub enabled: bool,
    /// Memorize after every N completed turns.
    pub every_n_turns: u64,
    pub user_id: String,
    pub user_name: String,
    pub agent_id: String,
    pub agent_name: String,
    /// Directory of the file-backed store used by the host binary.
    /// Defaults to `<data dir>/cadence/memory`.
    pub store_dir: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_n_turns: 2,
            user_id: "user".to_owned(),
            user_name: "User".to_owned(),
            agent_id: "agent".to_owned(),
            agent_name: "Assistant".to_owned(),
            store_dir: None,
        }
    }
}

impl MemoryConfig {
    /// Resolved directory for the file-backed memory store.
    pub fn resolved_store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("cadence")
                .join("memory")
        })
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/cadence/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("cadence")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(!config.greeting.is_empty());
        assert_eq!(config.interrupt_min_chars, 2);
        assert_eq!(config.default_session_id, "100");
        assert!(config.llm.max_tool_rounds > 0);
        assert!(config.memory.every_n_turns > 0);
        assert!(!config.memory.enabled);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AgentConfig::default();
        config.greeting = "Hi!".to_owned();
        config.llm.model = "local-model".to_owned();
        config.memory.enabled = true;
        config.save_to_file(&path).expect("save config");

        let loaded = AgentConfig::from_file(&path).expect("load config");
        assert_eq!(loaded.greeting, "Hi!");
        assert_eq!(loaded.llm.model, "local-model");
        assert!(loaded.memory.enabled);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
greeting = ""

[llm]
temperature = 0.2
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.greeting.is_empty());
        assert!((config.llm.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.llm.max_tokens, 512);
        assert_eq!(config.memory.every_n_turns, 2);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "greeting = [").unwrap();
        let err = AgentConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, crate::error::AgentError::Config(_)));
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = AgentConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("cadence"));
    }
}
