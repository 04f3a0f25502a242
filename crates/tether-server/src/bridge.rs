//! Client-facing half of a turn.
//!
//! Re-publishes the orchestrator's chunks as a cancelable stream of frames.
//! Error chunks are followed by a user-facing notification; an auth error
//! also parks the turn's request as a pending retry and emits a
//! `retry-intent` frame so the typed prompt survives re-authentication.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tether_core::chunks::Chunk;
use tether_core::errors::Notification;
use tether_core::ids::{SubChatId, TurnId};
use tether_core::prompt::Prompt;
use tether_engine::{EngineError, TurnHandle, TurnOrchestrator, TurnRequest};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryIntent {
    pub sub_chat_id: SubChatId,
    pub prompt: Prompt,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeFrame {
    Chunk(Chunk),
    RetryIntent(RetryIntent),
    Notification(Notification),
}

impl BridgeFrame {
    /// Event name used on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Chunk(_) => "chunk",
            Self::RetryIntent(_) => "retry-intent",
            Self::Notification(_) => "notification",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk),
            Self::RetryIntent(intent) => serde_json::to_string(intent),
            Self::Notification(notification) => serde_json::to_string(notification),
        }
    }

    pub fn as_chunk(&self) -> Option<&Chunk> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }
}

pub struct TransportBridge {
    orchestrator: Arc<TurnOrchestrator>,
    pending_retries: Arc<DashMap<SubChatId, TurnRequest>>,
}

impl TransportBridge {
    pub fn new(orchestrator: Arc<TurnOrchestrator>) -> Self {
        Self {
            orchestrator,
            pending_retries: Arc::new(DashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TurnOrchestrator> {
        &self.orchestrator
    }

    /// Start a turn and subscribe to it. A new turn on the sub-chat replaces
    /// any retry still parked for it.
    pub fn open(&self, request: TurnRequest) -> Result<TurnStream, EngineError> {
        let handle = self.orchestrator.start_turn(request.clone())?;
        if self.pending_retries.remove(&request.sub_chat_id).is_some() {
            debug!(sub_chat_id = %request.sub_chat_id, "pending retry superseded");
        }
        Ok(TurnStream {
            handle,
            request,
            orchestrator: self.orchestrator.clone(),
            pending_retries: self.pending_retries.clone(),
            queued: VecDeque::new(),
            finished: false,
        })
    }

    /// Hand back the request parked by an auth failure. Yields it once.
    pub fn take_pending_retry(&self, sub_chat_id: &SubChatId) -> Option<TurnRequest> {
        self.pending_retries.remove(sub_chat_id).map(|(_, req)| req)
    }

    pub fn has_pending_retry(&self, sub_chat_id: &SubChatId) -> bool {
        self.pending_retries.contains_key(sub_chat_id)
    }
}

/// Frames of one turn. Dropping or closing it before `finish` cancels the
/// turn.
pub struct TurnStream {
    handle: TurnHandle,
    request: TurnRequest,
    orchestrator: Arc<TurnOrchestrator>,
    pending_retries: Arc<DashMap<SubChatId, TurnRequest>>,
    queued: VecDeque<BridgeFrame>,
    finished: bool,
}

impl TurnStream {
    pub fn turn_id(&self) -> &TurnId {
        &self.handle.turn_id
    }

    pub fn sub_chat_id(&self) -> &SubChatId {
        &self.handle.sub_chat_id
    }

    /// Stop forwarding and cancel the turn. Returns false if the stream was
    /// already closed or finished.
    pub fn close(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.queued.clear();
        self.handle.chunks.close();
        let cancelled = self
            .orchestrator
            .cancel_turn(&self.handle.sub_chat_id, &self.handle.turn_id);
        info!(
            sub_chat_id = %self.handle.sub_chat_id,
            turn_id = %self.handle.turn_id,
            cancelled,
            "consumer closed turn stream"
        );
        true
    }

    fn enqueue(&mut self, chunk: Chunk) {
        match &chunk {
            Chunk::AuthError { category, .. } => {
                self.pending_retries
                    .insert(self.request.sub_chat_id.clone(), self.request.clone());
                let notification = category.notification();
                self.queued.push_back(BridgeFrame::Chunk(chunk));
                self.queued.push_back(BridgeFrame::RetryIntent(RetryIntent {
                    sub_chat_id: self.request.sub_chat_id.clone(),
                    prompt: self.request.prompt.clone(),
                }));
                self.queued.push_back(BridgeFrame::Notification(notification));
            }
            Chunk::Error { category, .. } => {
                let notification = category.notification();
                self.queued.push_back(BridgeFrame::Chunk(chunk));
                self.queued.push_back(BridgeFrame::Notification(notification));
            }
            Chunk::Finish => {
                self.finished = true;
                self.queued.push_back(BridgeFrame::Chunk(chunk));
            }
            _ => self.queued.push_back(BridgeFrame::Chunk(chunk)),
        }
    }
}

impl Stream for TurnStream {
    type Item = BridgeFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<BridgeFrame>> {
        let this = self.get_mut();
        if let Some(frame) = this.queued.pop_front() {
            return Poll::Ready(Some(frame));
        }
        if this.finished {
            return Poll::Ready(None);
        }
        match this.handle.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.enqueue(chunk);
                Poll::Ready(this.queued.pop_front())
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.finished {
            self.close();
        }
    }
}
