use serde_json::Value;
use tracing::debug;

use tether_core::chunks::Chunk;
use tether_core::ids::ToolUseId;
use tether_core::parts::{MessagePart, SessionMetadata, ToolPart};

/// A tool part that just moved to the `result` state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolResolved {
    pub tool_call_id: ToolUseId,
    pub tool_name: String,
    pub is_error: bool,
}

/// Folds a turn's chunks into the parts of one assistant message.
///
/// Text deltas are buffered until their block ends or a tool call arrives, so
/// parts keep the order in which content was produced.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    parts: Vec<MessagePart>,
    buffer: String,
    metadata: SessionMetadata,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &Chunk) -> Option<ToolResolved> {
        match chunk {
            Chunk::TextStart { .. } | Chunk::TextEnd { .. } => {
                self.flush_text();
                None
            }
            Chunk::TextDelta { delta, .. } => {
                self.buffer.push_str(delta);
                None
            }
            Chunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.flush_text();
                if self.tool_mut(tool_call_id).is_some() {
                    debug!(tool_call_id = %tool_call_id, "tool call already recorded");
                } else {
                    self.parts.push(MessagePart::Tool(ToolPart::call(
                        tool_call_id.clone(),
                        tool_name.clone(),
                        input.clone(),
                    )));
                }
                None
            }
            Chunk::ToolOutputAvailable {
                tool_call_id,
                output,
            } => self.resolve(tool_call_id, output.clone(), false),
            Chunk::ToolOutputError {
                tool_call_id,
                error_text,
            } => self.resolve(tool_call_id, Value::String(error_text.clone()), true),
            Chunk::MessageMetadata { message_metadata } => {
                self.metadata.merge(message_metadata);
                None
            }
            _ => None,
        }
    }

    /// Parts so far, including text that has not been flushed yet.
    pub fn snapshot(&self) -> Vec<MessagePart> {
        let mut parts = self.parts.clone();
        if !self.buffer.trim().is_empty() {
            parts.push(MessagePart::text(self.buffer.clone()));
        }
        parts
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn has_content(&self) -> bool {
        !self.parts.is_empty() || !self.buffer.trim().is_empty()
    }

    pub fn finalize(mut self) -> (Vec<MessagePart>, SessionMetadata) {
        self.flush_text();
        (self.parts, self.metadata)
    }

    fn flush_text(&mut self) {
        let text = std::mem::take(&mut self.buffer);
        if !text.trim().is_empty() {
            self.parts.push(MessagePart::Text { text });
        }
    }

    fn tool_mut(&mut self, id: &ToolUseId) -> Option<&mut ToolPart> {
        self.parts.iter_mut().find_map(|p| match p {
            MessagePart::Tool(t) if &t.tool_call_id == id => Some(t),
            _ => None,
        })
    }

    fn resolve(&mut self, id: &ToolUseId, result: Value, is_error: bool) -> Option<ToolResolved> {
        let Some(part) = self.tool_mut(id) else {
            debug!(tool_call_id = %id, "output for unknown tool call");
            return None;
        };
        part.resolve(result, is_error).then(|| ToolResolved {
            tool_call_id: id.clone(),
            tool_name: part.tool_name.clone(),
            is_error,
        })
    }
}
