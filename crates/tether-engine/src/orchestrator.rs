//! Turn lifecycle: Init, Streaming, then exactly one terminal path.
//!
//! Every turn ends by persisting whatever was accumulated, releasing its
//! registry entry and pending approvals, and emitting a single `finish` as
//! the last chunk, whether it completed, failed, was cancelled or stopped
//! after a plan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use tether_core::agent::{AgentRequest, PermissionDecision, ToolApprover, UpstreamAgent};
use tether_core::chunks::Chunk;
use tether_core::errors::{ErrorCategory, TurnFailure, UpstreamError};
use tether_core::ids::{AgentSessionId, ChatId, MessageId, SubChatId, ToolUseId, TurnId};
use tether_core::parts::{Role, StoredMessage};
use tether_core::prompt::{Prompt, TurnMode};
use tether_store::{LoadedSubChat, PersistenceGateway};

use crate::accumulator::MessageAccumulator;
use crate::broker::{ApprovalDecision, ResolutionReason, ToolApprovalBroker};
use crate::config::{EmptyResponsePolicy, EngineConfig};
use crate::error::EngineError;
use crate::registry::{CancelHandle, SessionRegistry};
use crate::sink::ChunkSink;
use crate::transformer::ChunkTransformer;

const SESSION_ENDED: &str = "Session ended";
const SHUTTING_DOWN: &str = "Server shutting down";

/// Parameters of one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub chat_id: ChatId,
    pub sub_chat_id: SubChatId,
    pub prompt: Prompt,
    #[serde(default)]
    pub mode: TurnMode,
    /// Overrides the session id stored for the sub-chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<AgentSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl TurnRequest {
    pub fn new(
        chat_id: ChatId,
        sub_chat_id: SubChatId,
        prompt: Prompt,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            chat_id,
            sub_chat_id,
            prompt,
            mode: TurnMode::default(),
            resume_session_id: None,
            model: None,
            working_directory: working_directory.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: TurnMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Consumer side of a running turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: TurnId,
    pub sub_chat_id: SubChatId,
    pub chunks: mpsc::Receiver<Chunk>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
enum Outcome {
    Completed,
    PlanStopped,
    Aborted,
    Failed(TurnFailure),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PlanStopped => "plan_stopped",
            Self::Aborted => "aborted",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct TurnOrchestrator {
    agent: Arc<dyn UpstreamAgent>,
    store: Arc<dyn PersistenceGateway>,
    broker: Arc<ToolApprovalBroker>,
    registry: Arc<SessionRegistry>,
    config: Arc<EngineConfig>,
}

impl TurnOrchestrator {
    pub fn new(
        agent: Arc<dyn UpstreamAgent>,
        store: Arc<dyn PersistenceGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agent,
            store,
            broker: Arc::new(ToolApprovalBroker::new(config.approval_timeout)),
            registry: Arc::new(SessionRegistry::new(config.max_turns_per_sub_chat)),
            config: Arc::new(config),
        }
    }

    pub fn broker(&self) -> &Arc<ToolApprovalBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the turn and run it in the background. Chunks arrive on the
    /// returned handle; dropping its receiver cancels the turn.
    #[instrument(skip(self, request), fields(sub_chat_id = %request.sub_chat_id, mode = ?request.mode))]
    pub fn start_turn(&self, request: TurnRequest) -> Result<TurnHandle, EngineError> {
        if request.prompt.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let handle = self.registry.start(&request.sub_chat_id);
        let (tx, rx) = mpsc::channel(self.config.chunk_buffer);
        let sink = ChunkSink::new(tx, request.sub_chat_id.clone());

        info!(turn_id = %handle.turn_id, "turn started");

        let turn = TurnHandle {
            turn_id: handle.turn_id.clone(),
            sub_chat_id: request.sub_chat_id.clone(),
            chunks: rx,
            cancel: handle.token.clone(),
        };

        let span = tracing::info_span!(
            "turn",
            sub_chat_id = %request.sub_chat_id,
            turn_id = %handle.turn_id,
        );
        let run = TurnRun {
            agent: self.agent.clone(),
            store: self.store.clone(),
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            request,
            handle,
            sink,
        };
        tokio::spawn(run.run().instrument(span));

        Ok(turn)
    }

    /// Cancel the sub-chat's active turn. Returns false if nothing was active.
    pub fn cancel(&self, sub_chat_id: &SubChatId) -> bool {
        let cancelled = self.registry.cancel(sub_chat_id);
        if cancelled {
            let _ = self.broker.cancel_all(sub_chat_id, SESSION_ENDED);
        }
        cancelled
    }

    /// Cancel a single turn. Tolerates turns that already ended.
    pub fn cancel_turn(&self, sub_chat_id: &SubChatId, turn_id: &TurnId) -> bool {
        self.registry.cancel_turn(sub_chat_id, turn_id)
    }

    pub fn is_active(&self, sub_chat_id: &SubChatId) -> bool {
        self.registry.is_active(sub_chat_id)
    }

    pub fn resolve_approval(&self, tool_use_id: &ToolUseId, decision: ApprovalDecision) -> bool {
        self.broker.resolve(tool_use_id, decision)
    }

    pub fn messages(&self, sub_chat_id: &SubChatId) -> Result<LoadedSubChat, EngineError> {
        Ok(self.store.load_messages(sub_chat_id)?)
    }

    /// Cancel every turn and deny every pending approval.
    pub fn shutdown(&self) -> usize {
        let denied = self.broker.deny_everything(SHUTTING_DOWN);
        let cancelled = self.registry.cancel_all();
        info!(cancelled, denied, "orchestrator shut down");
        cancelled
    }
}

struct TurnRun {
    agent: Arc<dyn UpstreamAgent>,
    store: Arc<dyn PersistenceGateway>,
    broker: Arc<ToolApprovalBroker>,
    registry: Arc<SessionRegistry>,
    config: Arc<EngineConfig>,
    request: TurnRequest,
    handle: CancelHandle,
    sink: ChunkSink,
}

impl TurnRun {
    async fn run(self) {
        let (user_message_id, stored_session) = self.persist_prompt();
        let resume = self.request.resume_session_id.clone().or(stored_session);

        self.sink
            .emit_or_cancel(Chunk::Start { message_id: None }, &self.handle.token)
            .await;

        let upstream_cancel = self.handle.token.child_token();
        let mut transformer = ChunkTransformer::new();
        let mut accumulator = MessageAccumulator::new();
        let outcome = self
            .stream(resume, &upstream_cancel, &mut transformer, &mut accumulator)
            .await;
        upstream_cancel.cancel();

        self.teardown(outcome, transformer, accumulator, user_message_id)
            .await;
    }

    /// Store the user's message unless it is already the last one, which
    /// happens when a failed turn is retried.
    fn persist_prompt(&self) -> (Option<MessageId>, Option<AgentSessionId>) {
        let req = &self.request;
        let loaded = self.store.load_messages(&req.sub_chat_id).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load sub-chat, starting fresh");
            LoadedSubChat::default()
        });

        let message = StoredMessage::user(&req.prompt);
        let duplicate = loaded
            .last_message()
            .filter(|last| last.role == Role::User && last.parts == message.parts);

        let message_id = match duplicate {
            Some(last) => {
                debug!(message_id = %last.id, "prompt already stored");
                if let Err(e) = self.store.mark_streaming(&req.chat_id, &req.sub_chat_id) {
                    warn!(error = %e, "failed to mark sub-chat streaming");
                }
                Some(last.id.clone())
            }
            None => match self
                .store
                .append_user_message(&req.chat_id, &req.sub_chat_id, &message)
            {
                Ok(()) => Some(message.id),
                Err(e) => {
                    error!(error = %e, "failed to persist user message");
                    None
                }
            },
        };
        (message_id, loaded.session_id)
    }

    async fn stream(
        &self,
        resume: Option<AgentSessionId>,
        upstream_cancel: &CancellationToken,
        transformer: &mut ChunkTransformer,
        accumulator: &mut MessageAccumulator,
    ) -> Outcome {
        let req = &self.request;
        let cancel = &self.handle.token;

        let mut env = self.config.agent_env.clone();
        env.extend(req.env.clone());
        let agent_request = AgentRequest {
            sub_chat_id: req.sub_chat_id.clone(),
            prompt: req.prompt.to_content(),
            working_directory: req.working_directory.clone(),
            config_dir: self.config.sub_chat_config_dir(&req.sub_chat_id),
            env,
            permission_mode: req.mode.permission_mode(),
            resume_session_id: resume,
            model: req.model.clone().or_else(|| self.config.default_model.clone()),
            cancel: upstream_cancel.clone(),
        };
        let approver: Arc<dyn ToolApprover> = Arc::new(TurnApprover {
            broker: self.broker.clone(),
            sink: self.sink.clone(),
            sub_chat_id: req.sub_chat_id.clone(),
            turn_id: self.handle.turn_id.clone(),
            cancel: upstream_cancel.clone(),
            config: self.config.clone(),
        });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Aborted,
            opened = self.agent.open(agent_request, approver) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(_) if cancel.is_cancelled() => return Outcome::Aborted,
            Err(e) => {
                warn!(agent = self.agent.name(), error = %e, "failed to open upstream");
                return Outcome::Failed(TurnFailure::from_upstream(&e));
            }
        };

        let mut events = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Aborted,
                _ = self.sink.closed() => {
                    info!("chunk consumer went away");
                    return Outcome::Aborted;
                }
                next = stream.next() => next,
            };

            let event = match next {
                None if events == 0 => return Outcome::Failed(TurnFailure::empty_response()),
                None => return Outcome::Completed,
                Some(Err(UpstreamError::Cancelled)) => return Outcome::Aborted,
                Some(Err(e)) => {
                    warn!(error = %e, events, "upstream failed mid-turn");
                    return Outcome::Failed(TurnFailure::from_upstream(&e));
                }
                Some(Ok(event)) => event,
            };
            events += 1;

            for chunk in transformer.transform(&event) {
                if let Chunk::Error { error_text, category } | Chunk::AuthError { error_text, category } =
                    &chunk
                {
                    return Outcome::Failed(TurnFailure::new(*category, error_text.clone()));
                }

                let resolved = accumulator.apply(&chunk);
                if !self.sink.emit_or_cancel(chunk, cancel).await && cancel.is_cancelled() {
                    return Outcome::Aborted;
                }

                if req.mode == TurnMode::Plan
                    && resolved.is_some_and(|r| r.tool_name == self.config.plan_exit_tool)
                {
                    info!("plan presented, stopping turn");
                    return Outcome::PlanStopped;
                }
            }
        }
    }

    /// State is settled before anything is emitted, so a consumer that stops
    /// reading cannot hold back persistence or the registry.
    async fn teardown(
        &self,
        outcome: Outcome,
        mut transformer: ChunkTransformer,
        mut accumulator: MessageAccumulator,
        user_message_id: Option<MessageId>,
    ) {
        let req = &self.request;

        let mut tail = transformer.finish();
        for chunk in &tail {
            accumulator.apply(chunk);
        }
        if let Outcome::Failed(failure) = &outcome {
            warn!(category = %failure.category, message = %failure.message, "turn failed");
            tail.push(failure.to_chunk());
        }

        let (parts, metadata) = accumulator.finalize();
        if let Err(e) = self
            .store
            .save_messages(&req.sub_chat_id, user_message_id.as_ref(), &parts, &metadata)
        {
            error!(error = %e, parts = parts.len(), "failed to persist assistant message");
        }

        let empty = matches!(&outcome, Outcome::Failed(f) if f.category == ErrorCategory::EmptyResponse);
        if empty && self.config.empty_response_policy == EmptyResponsePolicy::RemoveUserMessage {
            if let Some(id) = &user_message_id {
                match self.store.remove_message(&req.sub_chat_id, id) {
                    Ok(removed) => debug!(removed, "dropped prompt of empty response"),
                    Err(e) => warn!(error = %e, "failed to drop prompt of empty response"),
                }
            }
        }

        if let Err(e) = self.store.touch(&req.chat_id) {
            warn!(error = %e, "failed to touch chat");
        }

        self.registry.finish(&req.sub_chat_id, &self.handle.turn_id);
        let denied = self.broker.cancel_turn(&self.handle.turn_id, SESSION_ENDED);
        // Another live turn of the sub-chat still owns the marker.
        if !self.registry.is_active(&req.sub_chat_id) {
            if let Err(e) = self.store.clear_streaming(&req.sub_chat_id) {
                warn!(error = %e, "failed to clear streaming marker");
            }
        }

        for chunk in tail {
            self.sink.emit(chunk).await;
        }
        self.sink.emit(Chunk::Finish).await;
        info!(outcome = outcome.label(), parts = parts.len(), denied, "turn finished");
    }
}

/// Routes tools that need a human answer through the broker. Everything else
/// is allowed as-is.
struct TurnApprover {
    broker: Arc<ToolApprovalBroker>,
    sink: ChunkSink,
    sub_chat_id: SubChatId,
    turn_id: TurnId,
    /// Fires when the turn stops consuming upstream, on every exit path.
    cancel: CancellationToken,
    config: Arc<EngineConfig>,
}

#[async_trait]
impl ToolApprover for TurnApprover {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: &Value,
        tool_use_id: &ToolUseId,
    ) -> PermissionDecision {
        if !self.config.requires_confirmation(tool_name) {
            return PermissionDecision::allow(Some(input.clone()));
        }

        if self.cancel.is_cancelled() {
            return PermissionDecision::deny(SESSION_ENDED);
        }
        let ticket = self
            .broker
            .register(tool_use_id.clone(), self.sub_chat_id.clone(), self.turn_id.clone());
        self.sink
            .emit_or_cancel(
                Chunk::AskUserQuestion {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: tool_name.to_owned(),
                    input: input.clone(),
                },
                &self.cancel,
            )
            .await;

        let resolution = tokio::select! {
            resolution = self.broker.wait(ticket) => resolution,
            _ = self.cancel.cancelled() => {
                self.broker.cancel_turn(&self.turn_id, SESSION_ENDED);
                return PermissionDecision::deny(SESSION_ENDED);
            }
        };
        debug!(tool_use_id = %tool_use_id, reason = ?resolution.reason, "approval resolved");
        if resolution.reason == ResolutionReason::TimedOut {
            self.sink
                .emit_or_cancel(
                    Chunk::AskUserQuestionTimeout {
                        tool_use_id: tool_use_id.clone(),
                    },
                    &self.cancel,
                )
                .await;
        }
        resolution.decision.into_permission(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tether_agent::{MockAgent, MockResponse, MockStep};
    use tether_core::parts::{MessagePart, ToolState};
    use tether_core::prompt::PermissionMode;
    use tether_core::provider::ProviderEvent;
    use tether_store::MemoryGateway;

    struct Fixture {
        orchestrator: TurnOrchestrator,
        agent: Arc<MockAgent>,
        store: Arc<MemoryGateway>,
        _state: tempfile::TempDir,
    }

    fn fixture_with(responses: Vec<MockResponse>, mut config: EngineConfig) -> Fixture {
        let state = tempfile::tempdir().unwrap();
        config.state_root = state.path().to_path_buf();
        let agent = Arc::new(MockAgent::new(responses));
        let store = Arc::new(MemoryGateway::new());
        let orchestrator = TurnOrchestrator::new(agent.clone(), store.clone(), config);
        Fixture {
            orchestrator,
            agent,
            store,
            _state: state,
        }
    }

    fn fixture(responses: Vec<MockResponse>) -> Fixture {
        fixture_with(responses, EngineConfig::default())
    }

    fn request(sub: &str, text: &str) -> TurnRequest {
        TurnRequest::new(
            ChatId::from_raw("chat-1"),
            SubChatId::from_raw(sub),
            Prompt::text(text),
            "/tmp",
        )
    }

    async fn collect(handle: &mut TurnHandle) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = handle.chunks.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    async fn read_until(handle: &mut TurnHandle, kind: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = handle.chunks.recv().await {
            let done = chunk.kind() == kind;
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    fn kinds(chunks: &[Chunk]) -> Vec<&'static str> {
        chunks.iter().map(Chunk::kind).collect()
    }

    fn assert_single_trailing_finish(chunks: &[Chunk]) {
        assert_eq!(chunks.first().map(Chunk::kind), Some("start"));
        assert_eq!(chunks.last().map(Chunk::kind), Some("finish"));
        assert_eq!(chunks.iter().filter(|c| c.is_finish()).count(), 1);
    }

    #[tokio::test]
    async fn completed_turn_streams_and_persists() {
        let f = fixture(vec![MockResponse::text("Hello there")]);
        let sub = SubChatId::from_raw("sub-1");
        let mut handle = f.orchestrator.start_turn(request("sub-1", "hi")).unwrap();
        let chunks = collect(&mut handle).await;

        assert_single_trailing_finish(&chunks);
        assert_eq!(
            chunks.iter().filter(|c| c.kind() == "text-delta").count(),
            1,
            "final assistant message must not repeat streamed text"
        );
        assert!(!chunks.iter().any(Chunk::is_error_kind));

        let loaded = f.store.load_messages(&sub).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].text_content(), "hi");
        assert_eq!(loaded.messages[1].text_content(), "Hello there");
        assert_eq!(loaded.session_id.as_ref().map(|s| s.as_str()), Some("sess-mock"));
        assert!(!f.store.is_streaming(&sub).unwrap());
        assert!(!f.orchestrator.is_active(&sub));
        assert!(f.store.chat_updated_at(&ChatId::from_raw("chat-1")).is_some());
    }

    #[tokio::test]
    async fn second_turn_resumes_stored_session() {
        let f = fixture(vec![MockResponse::text("one"), MockResponse::text("two")]);
        let mut first = f.orchestrator.start_turn(request("sub-1", "first")).unwrap();
        collect(&mut first).await;
        let mut second = f.orchestrator.start_turn(request("sub-1", "second")).unwrap();
        collect(&mut second).await;

        let requests = f.agent.requests();
        assert!(requests[0].resume_session_id.is_none());
        assert_eq!(
            requests[1].resume_session_id.as_ref().map(|s| s.as_str()),
            Some("sess-mock")
        );
        assert!(requests[1].config_dir.ends_with("sub-chats/sub-1"));
    }

    #[tokio::test]
    async fn auth_error_then_finish_and_retry_does_not_duplicate_prompt() {
        let f = fixture(vec![
            MockResponse::events(vec![
                ProviderEvent::init("sess-a"),
                ProviderEvent::assistant_error("authentication_failed", "Please run /login"),
                ProviderEvent::assistant_text("never forwarded"),
            ]),
            MockResponse::text("welcome back"),
        ]);
        let sub = SubChatId::from_raw("sub-1");

        let mut handle = f.orchestrator.start_turn(request("sub-1", "hello")).unwrap();
        let chunks = collect(&mut handle).await;
        assert_single_trailing_finish(&chunks);
        let tail = kinds(&chunks[chunks.len() - 2..]);
        assert_eq!(tail, vec!["auth-error", "finish"]);
        assert_eq!(chunks.iter().filter(|c| c.is_error_kind()).count(), 1);
        assert_eq!(f.store.load_messages(&sub).unwrap().messages.len(), 1);

        let mut retry = f.orchestrator.start_turn(request("sub-1", "hello")).unwrap();
        collect(&mut retry).await;
        let loaded = f.store.load_messages(&sub).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].role, Role::User);
        assert_eq!(loaded.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn empty_response_keeps_prompt_by_default() {
        let f = fixture(vec![MockResponse::events(vec![])]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "anyone?")).unwrap();
        let chunks = collect(&mut handle).await;

        assert_single_trailing_finish(&chunks);
        let error = chunks.iter().find(|c| c.is_error_kind()).unwrap();
        assert_eq!(error.error_category(), Some(ErrorCategory::EmptyResponse));
        let loaded = f.store.load_messages(&SubChatId::from_raw("sub-1")).unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_response_can_drop_prompt() {
        let config = EngineConfig {
            empty_response_policy: EmptyResponsePolicy::RemoveUserMessage,
            ..Default::default()
        };
        let f = fixture_with(vec![MockResponse::events(vec![])], config);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "anyone?")).unwrap();
        collect(&mut handle).await;

        let loaded = f.store.load_messages(&SubChatId::from_raw("sub-1")).unwrap();
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn open_failure_is_categorized() {
        let f = fixture(vec![MockResponse::OpenError(UpstreamError::ExecutableNotFound(
            "claude".into(),
        ))]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "hi")).unwrap();
        let chunks = collect(&mut handle).await;

        assert_eq!(kinds(&chunks), vec!["start", "error", "finish"]);
        assert_eq!(chunks[1].error_category(), Some(ErrorCategory::ExecutableNotFound));
        assert!(!f.orchestrator.is_active(&SubChatId::from_raw("sub-1")));
    }

    #[tokio::test]
    async fn cancel_persists_partial_text() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::Event(ProviderEvent::init("sess-c")),
            MockStep::Event(ProviderEvent::text_block_start(0)),
            MockStep::Event(ProviderEvent::text_delta(0, "partial answer")),
            MockStep::HangUntilCancelled,
        ])]);
        let sub = SubChatId::from_raw("sub-1");
        let mut handle = f.orchestrator.start_turn(request("sub-1", "go")).unwrap();
        read_until(&mut handle, "text-delta").await;

        assert!(f.orchestrator.cancel(&sub));
        assert!(!f.orchestrator.cancel(&sub));

        let rest = collect(&mut handle).await;
        assert_eq!(kinds(&rest), vec!["text-end", "finish"]);

        let loaded = f.store.load_messages(&sub).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].text_content(), "partial answer");
        assert_eq!(loaded.session_id.as_ref().map(|s| s.as_str()), Some("sess-c"));
        assert!(!f.store.is_streaming(&sub).unwrap());
    }

    #[tokio::test]
    async fn crash_persists_partial_text() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::Event(ProviderEvent::text_delta(0, "half")),
            MockStep::Fail(UpstreamError::ProcessExited {
                code: Some(1),
                stderr: "segfault".into(),
            }),
        ])]);
        let sub = SubChatId::from_raw("sub-1");
        let mut handle = f.orchestrator.start_turn(request("sub-1", "go")).unwrap();
        let chunks = collect(&mut handle).await;

        assert_single_trailing_finish(&chunks);
        let error = chunks.iter().find(|c| c.is_error_kind()).unwrap();
        assert_eq!(error.error_category(), Some(ErrorCategory::ProcessCrash));
        assert_eq!(f.store.load_messages(&sub).unwrap().messages[1].text_content(), "half");
    }

    #[tokio::test]
    async fn plan_mode_stops_after_exit_plan() {
        let f = fixture(vec![MockResponse::events(vec![
            ProviderEvent::assistant_tool_use("toolu_plan", "ExitPlanMode", json!({"plan": "1. do it"})),
            ProviderEvent::tool_result("toolu_plan", json!("ok"), false),
            ProviderEvent::assistant_text("should never arrive"),
            ProviderEvent::success("sess-p", 1, 1),
        ])]);
        let req = request("sub-1", "plan it").with_mode(TurnMode::Plan);
        let mut handle = f.orchestrator.start_turn(req).unwrap();
        let chunks = collect(&mut handle).await;

        assert_single_trailing_finish(&chunks);
        let output_at = chunks
            .iter()
            .position(|c| c.kind() == "tool-output-available")
            .unwrap();
        assert_eq!(kinds(&chunks[output_at + 1..]), vec!["finish"]);
        assert!(!chunks.iter().any(|c| c.kind() == "text-delta"));
        assert_eq!(f.agent.requests()[0].permission_mode, PermissionMode::Plan);

        let loaded = f.store.load_messages(&SubChatId::from_raw("sub-1")).unwrap();
        let tool = loaded.messages[1].parts[0].as_tool().unwrap();
        assert_eq!(tool.state, ToolState::Result);
    }

    #[tokio::test]
    async fn exit_plan_in_agent_mode_does_not_stop() {
        let f = fixture(vec![MockResponse::events(vec![
            ProviderEvent::assistant_tool_use("toolu_plan", "ExitPlanMode", json!({})),
            ProviderEvent::tool_result("toolu_plan", json!("ok"), false),
            ProviderEvent::assistant_text("carrying on"),
            ProviderEvent::success("sess-p", 1, 1),
        ])]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "go")).unwrap();
        let chunks = collect(&mut handle).await;
        assert!(chunks.iter().any(|c| c.kind() == "text-delta"));
    }

    #[tokio::test]
    async fn approval_answer_reaches_upstream() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::AskApproval {
                tool_name: "AskUserQuestion".into(),
                tool_use_id: ToolUseId::from_raw("toolu_q"),
                input: json!({"questions": [{"question": "Which?"}]}),
            },
            MockStep::Event(ProviderEvent::assistant_text("thanks")),
            MockStep::Event(ProviderEvent::success("sess-q", 1, 1)),
        ])]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "ask me")).unwrap();
        let seen = read_until(&mut handle, "ask-user-question").await;
        assert_eq!(seen.last().map(Chunk::kind), Some("ask-user-question"));

        let answers = json!({"questions": [{"question": "Which?"}], "answers": {"Which?": "A"}});
        assert!(f.orchestrator.resolve_approval(
            &ToolUseId::from_raw("toolu_q"),
            ApprovalDecision::approve(Some(answers.clone())),
        ));
        let rest = collect(&mut handle).await;
        assert_eq!(rest.last().map(Chunk::kind), Some("finish"));

        let decisions = f.agent.decisions();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].1.is_allowed());
        assert_eq!(decisions[0].1.updated_input, Some(answers));
        assert!(!f
            .orchestrator
            .resolve_approval(&ToolUseId::from_raw("toolu_q"), ApprovalDecision::approve(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_times_out_once() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::AskApproval {
                tool_name: "AskUserQuestion".into(),
                tool_use_id: ToolUseId::from_raw("toolu_q"),
                input: json!({}),
            },
            MockStep::Event(ProviderEvent::success("sess-q", 1, 1)),
        ])]);
        let started = tokio::time::Instant::now();
        let mut handle = f.orchestrator.start_turn(request("sub-1", "ask me")).unwrap();
        let chunks = collect(&mut handle).await;

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_single_trailing_finish(&chunks);
        assert_eq!(
            chunks
                .iter()
                .filter(|c| c.kind() == "ask-user-question-timeout")
                .count(),
            1
        );
        assert_eq!(f.orchestrator.broker().pending_count(), 0);
        let decisions = f.agent.decisions();
        assert!(!decisions[0].1.is_allowed());
        assert_eq!(decisions[0].1.message.as_deref(), Some("Timed out"));
    }

    #[tokio::test]
    async fn unlisted_tools_are_allowed_without_asking() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::AskApproval {
                tool_name: "Bash".into(),
                tool_use_id: ToolUseId::from_raw("toolu_b"),
                input: json!({"command": "ls"}),
            },
            MockStep::Event(ProviderEvent::success("sess-b", 1, 1)),
        ])]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "run")).unwrap();
        let chunks = collect(&mut handle).await;

        assert!(!chunks.iter().any(|c| c.kind() == "ask-user-question"));
        assert!(f.agent.decisions()[0].1.is_allowed());
    }

    #[tokio::test]
    async fn dropping_receiver_cancels_turn() {
        let f = fixture(vec![MockResponse::Script(vec![
            MockStep::Event(ProviderEvent::text_delta(0, "streaming")),
            MockStep::HangUntilCancelled,
        ])]);
        let sub = SubChatId::from_raw("sub-1");
        let mut handle = f.orchestrator.start_turn(request("sub-1", "go")).unwrap();
        read_until(&mut handle, "text-delta").await;
        drop(handle);

        for _ in 0..100 {
            if !f.orchestrator.is_active(&sub) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.orchestrator.is_active(&sub));
        assert!(f.agent.requests()[0].cancel.is_cancelled());
        assert!(!f.store.is_streaming(&sub).unwrap());
    }

    #[tokio::test]
    async fn new_turn_supersedes_running_one() {
        let f = fixture(vec![
            MockResponse::Script(vec![MockStep::HangUntilCancelled]),
            MockResponse::text("second wins"),
        ]);
        let sub = SubChatId::from_raw("sub-1");
        let mut first = f.orchestrator.start_turn(request("sub-1", "one")).unwrap();
        let mut second = f.orchestrator.start_turn(request("sub-1", "two")).unwrap();

        let first_chunks = collect(&mut first).await;
        assert_eq!(first_chunks.last().map(Chunk::kind), Some("finish"));
        let second_chunks = collect(&mut second).await;
        assert_single_trailing_finish(&second_chunks);
        assert!(!f.orchestrator.is_active(&sub));
    }

    fn ask(tool_use_id: &str) -> MockStep {
        MockStep::AskApproval {
            tool_name: "AskUserQuestion".into(),
            tool_use_id: ToolUseId::from_raw(tool_use_id),
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn superseded_turn_denies_its_own_approvals() {
        let f = fixture(vec![
            MockResponse::Script(vec![ask("toolu_old"), MockStep::HangUntilCancelled]),
            MockResponse::Script(vec![ask("toolu_new"), MockStep::HangUntilCancelled]),
        ]);
        let sub = SubChatId::from_raw("sub-1");
        let mut old = f.orchestrator.start_turn(request("sub-1", "one")).unwrap();
        read_until(&mut old, "ask-user-question").await;

        let mut new = f.orchestrator.start_turn(request("sub-1", "two")).unwrap();
        read_until(&mut new, "ask-user-question").await;
        let tail = collect(&mut old).await;
        assert_eq!(tail.last().map(Chunk::kind), Some("finish"));

        let broker = f.orchestrator.broker();
        assert!(!broker.is_pending(&ToolUseId::from_raw("toolu_old")));
        assert!(!f
            .orchestrator
            .resolve_approval(&ToolUseId::from_raw("toolu_old"), ApprovalDecision::approve(None)));
        assert!(broker.is_pending(&ToolUseId::from_raw("toolu_new")));
        assert!(f.orchestrator.is_active(&sub));

        assert!(f.orchestrator.cancel(&sub));
        collect(&mut new).await;
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_is_observed_while_consumer_is_not_reading() {
        let config = EngineConfig {
            chunk_buffer: 4,
            ..Default::default()
        };
        let mut steps = vec![MockStep::Event(ProviderEvent::text_block_start(0))];
        steps.extend((0..20).map(|i| MockStep::Event(ProviderEvent::text_delta(0, &format!("w{i} ")))));
        steps.push(MockStep::HangUntilCancelled);
        let f = fixture_with(vec![MockResponse::Script(steps)], config);
        let sub = SubChatId::from_raw("sub-1");

        let mut handle = f.orchestrator.start_turn(request("sub-1", "go")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.orchestrator.cancel(&sub));

        for _ in 0..100 {
            if !f.store.is_streaming(&sub).unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.store.is_streaming(&sub).unwrap());
        assert!(!f.orchestrator.is_active(&sub));
        let loaded = f.store.load_messages(&sub).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.messages[1].text_content().starts_with("w0"));

        let chunks = collect(&mut handle).await;
        assert_single_trailing_finish(&chunks);
    }

    #[tokio::test]
    async fn streaming_marker_outlives_a_sibling_turn() {
        let config = EngineConfig {
            max_turns_per_sub_chat: 2,
            ..Default::default()
        };
        let f = fixture_with(
            vec![
                MockResponse::Script(vec![MockStep::HangUntilCancelled]),
                MockResponse::Script(vec![MockStep::HangUntilCancelled]),
            ],
            config,
        );
        let sub = SubChatId::from_raw("sub-1");
        let mut first = f.orchestrator.start_turn(request("sub-1", "one")).unwrap();
        let mut second = f.orchestrator.start_turn(request("sub-1", "two")).unwrap();
        read_until(&mut first, "start").await;
        read_until(&mut second, "start").await;

        assert!(f.orchestrator.cancel_turn(&sub, &first.turn_id));
        collect(&mut first).await;
        assert!(f.orchestrator.is_active(&sub));
        assert!(f.store.is_streaming(&sub).unwrap());

        assert!(f.orchestrator.cancel(&sub));
        collect(&mut second).await;
        assert!(!f.store.is_streaming(&sub).unwrap());
    }

    #[tokio::test]
    async fn superseded_partial_reply_stays_before_newer_prompt() {
        let f = fixture(vec![
            MockResponse::Script(vec![
                MockStep::Event(ProviderEvent::text_block_start(0)),
                MockStep::Event(ProviderEvent::text_delta(0, "partial")),
                MockStep::HangUntilCancelled,
            ]),
            MockResponse::text("fresh"),
        ]);
        let mut first = f.orchestrator.start_turn(request("sub-1", "one")).unwrap();
        read_until(&mut first, "text-delta").await;
        let mut second = f.orchestrator.start_turn(request("sub-1", "two")).unwrap();
        collect(&mut first).await;
        collect(&mut second).await;

        let texts: Vec<String> = f
            .store
            .load_messages(&SubChatId::from_raw("sub-1"))
            .unwrap()
            .messages
            .iter()
            .map(StoredMessage::text_content)
            .collect();
        assert_eq!(texts, vec!["one", "partial", "two", "fresh"]);
    }

    #[tokio::test]
    async fn failed_save_still_finishes() {
        let f = fixture(vec![MockResponse::text("lost")]);
        f.store.fail_saves(true);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "hi")).unwrap();
        let chunks = collect(&mut handle).await;
        assert_single_trailing_finish(&chunks);
        assert!(!f.orchestrator.is_active(&SubChatId::from_raw("sub-1")));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let f = fixture(vec![]);
        let err = f.orchestrator.start_turn(request("sub-1", "   ")).unwrap_err();
        assert!(matches!(err, EngineError::EmptyPrompt));
        assert_eq!(f.agent.call_count(), 0);
    }

    #[tokio::test]
    async fn tool_parts_are_persisted_with_results() {
        let f = fixture(vec![MockResponse::events(vec![
            ProviderEvent::tool_block_start(0, "toolu_r", "Read"),
            ProviderEvent::input_json_delta(0, r#"{"path":"a.rs"}"#),
            ProviderEvent::block_stop(0),
            ProviderEvent::tool_result("toolu_r", json!("fn main() {}"), false),
            ProviderEvent::tool_result("toolu_r", json!("duplicate"), false),
            ProviderEvent::assistant_text("Read it."),
            ProviderEvent::success("sess-r", 3, 4),
        ])]);
        let mut handle = f.orchestrator.start_turn(request("sub-1", "read")).unwrap();
        let chunks = collect(&mut handle).await;
        assert_eq!(
            chunks
                .iter()
                .filter(|c| c.kind() == "tool-output-available")
                .count(),
            1
        );

        let loaded = f.store.load_messages(&SubChatId::from_raw("sub-1")).unwrap();
        let parts = &loaded.messages[1].parts;
        assert_eq!(parts.len(), 2);
        let tool = parts[0].as_tool().unwrap();
        assert_eq!(tool.input, json!({"path": "a.rs"}));
        assert_eq!(tool.result, Some(json!("fn main() {}")));
        assert_eq!(parts[1], MessagePart::text("Read it."));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let f = fixture(vec![
            MockResponse::Script(vec![MockStep::HangUntilCancelled]),
            MockResponse::Script(vec![MockStep::HangUntilCancelled]),
        ]);
        let mut a = f.orchestrator.start_turn(request("a", "x")).unwrap();
        let mut b = f.orchestrator.start_turn(request("b", "y")).unwrap();
        assert_eq!(f.orchestrator.shutdown(), 2);
        assert_eq!(collect(&mut a).await.last().map(Chunk::kind), Some("finish"));
        assert_eq!(collect(&mut b).await.last().map(Chunk::kind), Some("finish"));
    }
}
