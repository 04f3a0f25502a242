use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use tether_core::agent::{
    AgentRequest, PermissionDecision, ProviderStream, ToolApprover, UpstreamAgent,
};
use tether_core::errors::UpstreamError;
use tether_core::ids::ToolUseId;
use tether_core::provider::ProviderEvent;

/// One step of a scripted upstream turn.
#[derive(Clone, Debug)]
pub enum MockStep {
    Event(ProviderEvent),
    Delay(Duration),
    /// Yield an error from the stream and stop.
    Fail(UpstreamError),
    /// Ask the approver about a tool and wait for the answer.
    AskApproval {
        tool_name: String,
        tool_use_id: ToolUseId,
        input: Value,
    },
    /// Produce nothing more until the turn is cancelled.
    HangUntilCancelled,
}

/// Pre-programmed behaviour for one `open()` call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Script(Vec<MockStep>),
    /// Fail the `open()` call itself.
    OpenError(UpstreamError),
}

impl MockResponse {
    pub fn events(events: Vec<ProviderEvent>) -> Self {
        Self::Script(events.into_iter().map(MockStep::Event).collect())
    }

    /// A complete streamed text answer followed by a success result.
    pub fn text(text: &str) -> Self {
        Self::events(vec![
            ProviderEvent::init("sess-mock"),
            ProviderEvent::text_block_start(0),
            ProviderEvent::text_delta(0, text),
            ProviderEvent::block_stop(0),
            ProviderEvent::assistant_text(text),
            ProviderEvent::success("sess-mock", 10, 5),
        ])
    }
}

/// Upstream agent that replays scripted responses in call order.
pub struct MockAgent {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
    decisions: Arc<Mutex<Vec<(ToolUseId, PermissionDecision)>>>,
}

impl MockAgent {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            decisions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }

    /// Approval answers received so far, in order.
    pub fn decisions(&self) -> Vec<(ToolUseId, PermissionDecision)> {
        self.decisions.lock().clone()
    }
}

#[async_trait]
impl UpstreamAgent for MockAgent {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(
        &self,
        request: AgentRequest,
        approver: Arc<dyn ToolApprover>,
    ) -> Result<ProviderStream, UpstreamError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let steps = match self.responses.get(idx) {
            Some(MockResponse::Script(steps)) => steps.clone(),
            Some(MockResponse::OpenError(e)) => return Err(e.clone()),
            None => {
                return Err(UpstreamError::Protocol(format!(
                    "MockAgent: no response configured for call {idx}"
                )))
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let cancel = request.cancel.clone();
        let decisions = self.decisions.clone();

        tokio::spawn(async move {
            for step in steps {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    MockStep::Event(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    MockStep::Delay(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    MockStep::Fail(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                    MockStep::AskApproval {
                        tool_name,
                        tool_use_id,
                        input,
                    } => {
                        let decision = tokio::select! {
                            _ = cancel.cancelled() => return,
                            d = approver.can_use_tool(&tool_name, &input, &tool_use_id) => d,
                        };
                        decisions.lock().push((tool_use_id, decision));
                    }
                    MockStep::HangUntilCancelled => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
