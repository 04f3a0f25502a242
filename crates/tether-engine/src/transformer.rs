//! Maps upstream provider events onto the client chunk protocol.
//!
//! The provider streams partial content blocks and then repeats the finished
//! message as one `assistant` event. Blocks that were already streamed are not
//! emitted a second time.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, trace};

use tether_core::chunks::Chunk;
use tether_core::errors::TurnFailure;
use tether_core::ids::ToolUseId;
use tether_core::parts::SessionMetadata;
use tether_core::provider::{
    AssistantBlock, AssistantEvent, BlockDelta, BlockStart, ProviderEvent, ResultEvent,
    StreamDelta, UserBlock, UserContent,
};

#[derive(Debug)]
enum OpenBlock {
    Text { id: String },
    Tool { id: ToolUseId, name: String, json: String },
    Thinking { id: String },
}

/// Stateful per-turn event normalizer.
#[derive(Debug, Default)]
pub struct ChunkTransformer {
    open: HashMap<u32, OpenBlock>,
    seq: u32,
    step_open: bool,
    /// Text or reasoning streamed since the last `message_start`.
    streamed_text: bool,
    streamed_thinking: bool,
    streamed_tools: HashSet<ToolUseId>,
    tool_outputs: HashSet<ToolUseId>,
}

impl ChunkTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&mut self, event: &ProviderEvent) -> Vec<Chunk> {
        match event {
            ProviderEvent::System(system) => match &system.session_id {
                Some(session_id) if system.subtype == "init" => vec![Chunk::MessageMetadata {
                    message_metadata: SessionMetadata {
                        session_id: Some(session_id.clone()),
                        ..Default::default()
                    },
                }],
                _ => Vec::new(),
            },
            ProviderEvent::StreamEvent(envelope) => self.stream(&envelope.event),
            ProviderEvent::Assistant(assistant) => self.assistant(assistant),
            ProviderEvent::User(user) => self.user(&user.message.content),
            ProviderEvent::Result(result) => self.result(result),
            ProviderEvent::Unknown => {
                trace!("dropping unknown provider event");
                Vec::new()
            }
        }
    }

    /// Close whatever is still open when the turn ends.
    pub fn finish(&mut self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut indices: Vec<u32> = self.open.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            match self.open.remove(&index) {
                Some(OpenBlock::Text { id }) => chunks.push(Chunk::TextEnd { id }),
                Some(OpenBlock::Tool { id, name, json }) => {
                    chunks.push(Chunk::ToolInputAvailable {
                        tool_call_id: id,
                        tool_name: name,
                        input: parse_tool_input(&json),
                    });
                }
                Some(OpenBlock::Thinking { .. }) | None => {}
            }
        }
        self.open.clear();
        if self.step_open {
            self.step_open = false;
            chunks.push(Chunk::FinishStep);
        }
        chunks
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn stream(&mut self, delta: &StreamDelta) -> Vec<Chunk> {
        match delta {
            StreamDelta::MessageStart {} => {
                self.streamed_text = false;
                self.streamed_thinking = false;
                let mut chunks = self.close_step();
                self.step_open = true;
                chunks.push(Chunk::StartStep);
                chunks
            }
            StreamDelta::MessageStop {} => self.close_step(),
            StreamDelta::ContentBlockStart { index, content_block } => match content_block {
                BlockStart::Text {} => {
                    let id = self.next_id("text");
                    self.streamed_text = true;
                    self.open.insert(*index, OpenBlock::Text { id: id.clone() });
                    vec![Chunk::TextStart { id }]
                }
                BlockStart::ToolUse { id, name } => {
                    self.streamed_tools.insert(id.clone());
                    self.open.insert(
                        *index,
                        OpenBlock::Tool {
                            id: id.clone(),
                            name: name.clone(),
                            json: String::new(),
                        },
                    );
                    vec![Chunk::ToolInputStart {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                    }]
                }
                BlockStart::Thinking {} => {
                    let id = self.next_id("reasoning");
                    self.streamed_thinking = true;
                    self.open.insert(*index, OpenBlock::Thinking { id });
                    Vec::new()
                }
                BlockStart::Unknown => Vec::new(),
            },
            StreamDelta::ContentBlockDelta { index, delta } => self.block_delta(*index, delta),
            StreamDelta::ContentBlockStop { index } => match self.open.remove(index) {
                Some(OpenBlock::Text { id }) => vec![Chunk::TextEnd { id }],
                Some(OpenBlock::Tool { id, name, json }) => vec![Chunk::ToolInputAvailable {
                    tool_call_id: id,
                    tool_name: name,
                    input: parse_tool_input(&json),
                }],
                Some(OpenBlock::Thinking { .. }) | None => Vec::new(),
            },
            StreamDelta::MessageDelta {} | StreamDelta::Unknown => Vec::new(),
        }
    }

    fn block_delta(&mut self, index: u32, delta: &BlockDelta) -> Vec<Chunk> {
        match delta {
            BlockDelta::TextDelta { text } => {
                let mut chunks = Vec::new();
                let id = match self.open.get(&index) {
                    Some(OpenBlock::Text { id }) => id.clone(),
                    _ => {
                        // Delta without a start: open the block implicitly.
                        let id = self.next_id("text");
                        self.streamed_text = true;
                        self.open.insert(index, OpenBlock::Text { id: id.clone() });
                        chunks.push(Chunk::TextStart { id: id.clone() });
                        id
                    }
                };
                chunks.push(Chunk::TextDelta {
                    id,
                    delta: text.clone(),
                });
                chunks
            }
            BlockDelta::InputJsonDelta { partial_json } => match self.open.get_mut(&index) {
                Some(OpenBlock::Tool { id, json, .. }) => {
                    json.push_str(partial_json);
                    vec![Chunk::ToolInputDelta {
                        tool_call_id: id.clone(),
                        input_text_delta: partial_json.clone(),
                    }]
                }
                _ => {
                    debug!(index, "input delta for unknown block");
                    Vec::new()
                }
            },
            BlockDelta::ThinkingDelta { thinking } => match self.open.get(&index) {
                Some(OpenBlock::Thinking { id }) => vec![Chunk::ReasoningDelta {
                    id: id.clone(),
                    delta: thinking.clone(),
                }],
                _ => Vec::new(),
            },
            BlockDelta::Unknown => Vec::new(),
        }
    }

    fn assistant(&mut self, event: &AssistantEvent) -> Vec<Chunk> {
        if let Some(error) = &event.error {
            let text: String = event
                .message
                .content
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            let mut failure = TurnFailure::from_text(format!("{error}: {text}"));
            if !text.trim().is_empty() {
                failure.message = text;
            } else {
                failure.message.clone_from(error);
            }
            return vec![failure.to_chunk()];
        }

        let mut chunks = Vec::new();
        for block in &event.message.content {
            match block {
                AssistantBlock::Text { text } => {
                    if self.streamed_text || text.is_empty() {
                        continue;
                    }
                    let id = self.next_id("text");
                    chunks.push(Chunk::TextStart { id: id.clone() });
                    chunks.push(Chunk::TextDelta {
                        id: id.clone(),
                        delta: text.clone(),
                    });
                    chunks.push(Chunk::TextEnd { id });
                }
                AssistantBlock::ToolUse { id, name, input } => {
                    if !self.streamed_tools.insert(id.clone()) {
                        continue;
                    }
                    chunks.push(Chunk::ToolInputStart {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                    });
                    chunks.push(Chunk::ToolInputAvailable {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        input: input.clone(),
                    });
                }
                AssistantBlock::Thinking { thinking } => {
                    if self.streamed_thinking || thinking.is_empty() {
                        continue;
                    }
                    let id = self.next_id("reasoning");
                    chunks.push(Chunk::Reasoning {
                        id,
                        text: thinking.clone(),
                    });
                }
                AssistantBlock::Unknown => {}
            }
        }
        chunks
    }

    fn user(&mut self, content: &UserContent) -> Vec<Chunk> {
        let UserContent::Blocks(blocks) = content else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        for block in blocks {
            let UserBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };
            if !self.tool_outputs.insert(tool_use_id.clone()) {
                debug!(tool_use_id = %tool_use_id, "duplicate tool result dropped");
                continue;
            }
            if *is_error {
                chunks.push(Chunk::ToolOutputError {
                    tool_call_id: tool_use_id.clone(),
                    error_text: result_text(content),
                });
            } else {
                chunks.push(Chunk::ToolOutputAvailable {
                    tool_call_id: tool_use_id.clone(),
                    output: content.clone(),
                });
            }
        }
        chunks
    }

    fn result(&mut self, result: &ResultEvent) -> Vec<Chunk> {
        let usage = result.usage.as_ref();
        let metadata = SessionMetadata {
            session_id: result.session_id.clone(),
            input_tokens: usage.map(|u| u.total_input()),
            output_tokens: usage.map(|u| u.output_tokens),
            total_tokens: usage.map(|u| u.total_input() + u.output_tokens),
            total_cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
        };

        let mut chunks = self.close_step();
        if !metadata.is_empty() {
            chunks.push(Chunk::MessageMetadata {
                message_metadata: metadata,
            });
        }
        if result.is_error {
            let text = result
                .result
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| result.subtype.clone());
            chunks.push(TurnFailure::from_text(text).to_chunk());
        }
        chunks
    }

    fn close_step(&mut self) -> Vec<Chunk> {
        if self.step_open {
            self.step_open = false;
            vec![Chunk::FinishStep]
        } else {
            Vec::new()
        }
    }
}

fn parse_tool_input(json: &str) -> Value {
    if json.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(json).unwrap_or_else(|_| Value::String(json.to_owned()))
}

/// Tool results arrive as a string or as a list of `{type: text, text}` blocks.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
