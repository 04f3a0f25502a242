//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is `#[serde(default)]`
//! so a partial file only overrides what it names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    pub version: String,
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub agent: AgentSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            engine: EngineSettings::default(),
            agent: AgentSettings::default(),
            store: StoreSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// HTTP listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on how long a client may take to send a request body.
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4317,
            request_timeout_ms: 30_000,
        }
    }
}

/// What to do with the stored user message when a turn produced nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResponsePolicy {
    #[default]
    KeepUserMessage,
    RemoveUserMessage,
}

/// Turn orchestration knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// How long a tool approval may stay unanswered.
    pub approval_timeout_ms: u64,
    /// Live turns allowed per sub-chat before the oldest is cancelled.
    pub max_turns_per_sub_chat: usize,
    pub empty_response_policy: EmptyResponsePolicy,
    /// Tools that must be confirmed by the user. Everything else auto-allows.
    pub confirm_tools: Vec<String>,
    /// Tool whose resolution ends a plan-mode turn.
    pub plan_exit_tool: String,
    /// Capacity of the per-turn chunk channel.
    pub chunk_buffer: usize,
    /// Root for per-sub-chat agent state (relative to `~/.tether`).
    pub state_dir: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            approval_timeout_ms: 60_000,
            max_turns_per_sub_chat: 1,
            empty_response_policy: EmptyResponsePolicy::KeepUserMessage,
            confirm_tools: vec!["AskUserQuestion".to_string()],
            plan_exit_tool: "ExitPlanMode".to_string(),
            chunk_buffer: 256,
            state_dir: "state".to_string(),
        }
    }
}

/// Upstream agent process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Explicit executable path. Searched on `PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Extra environment passed to every agent process.
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite database path (relative to `~/.tether`).
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "tether.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-module level overrides, e.g. `{"tether_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: TetherSettings =
            serde_json::from_str(r#"{"engine": {"approvalTimeoutMs": 5000}}"#).unwrap();
        assert_eq!(settings.engine.approval_timeout_ms, 5000);
        assert_eq!(settings.engine.chunk_buffer, 256);
        assert_eq!(settings.server.port, 4317);
    }

    #[test]
    fn empty_response_policy_wire_format() {
        let policy: EmptyResponsePolicy = serde_json::from_str(r#""remove_user_message""#).unwrap();
        assert_eq!(policy, EmptyResponsePolicy::RemoveUserMessage);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(json["engine"].get("maxTurnsPerSubChat").is_some());
        assert!(json["agent"].get("binary").is_none());
    }
}
