use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tether_core::ids::SubChatId;
use tether_settings::{resolve_path, TetherSettings};

pub use tether_settings::EmptyResponsePolicy;

/// Runtime configuration for the turn engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub approval_timeout: Duration,
    pub max_turns_per_sub_chat: usize,
    pub empty_response_policy: EmptyResponsePolicy,
    pub confirm_tools: Vec<String>,
    pub plan_exit_tool: String,
    pub chunk_buffer: usize,
    /// Per-sub-chat agent state lives under `<state_root>/sub-chats/<id>`.
    pub state_root: PathBuf,
    pub default_model: Option<String>,
    /// Environment passed to every upstream agent, below the request's own.
    pub agent_env: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let engine = &settings.engine;
        Self {
            approval_timeout: Duration::from_millis(engine.approval_timeout_ms),
            max_turns_per_sub_chat: engine.max_turns_per_sub_chat.max(1),
            empty_response_policy: engine.empty_response_policy,
            confirm_tools: engine.confirm_tools.clone(),
            plan_exit_tool: engine.plan_exit_tool.clone(),
            chunk_buffer: engine.chunk_buffer.max(1),
            state_root: resolve_path(&engine.state_dir),
            default_model: settings.agent.default_model.clone(),
            agent_env: settings
                .agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.confirm_tools.iter().any(|t| t == tool_name)
    }

    pub fn sub_chat_config_dir(&self, sub_chat_id: &SubChatId) -> PathBuf {
        self.state_root.join("sub-chats").join(sub_chat_id.as_str())
    }
}
