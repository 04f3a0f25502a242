use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_core::chunks::Chunk;
use tether_core::ids::SubChatId;

/// Sending half of a turn's chunk stream.
///
/// A consumer that went away is not an error for the turn: chunks are dropped
/// and the turn still tears down normally. Nothing is delivered after
/// `finish`.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<Chunk>,
    sub_chat_id: SubChatId,
    finished: Arc<AtomicBool>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<Chunk>, sub_chat_id: SubChatId) -> Self {
        Self {
            tx,
            sub_chat_id,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns whether the chunk was delivered.
    pub async fn emit(&self, chunk: Chunk) -> bool {
        if self.finished.load(Ordering::Acquire) {
            debug!(sub_chat_id = %self.sub_chat_id, kind = chunk.kind(), "chunk after finish dropped");
            return false;
        }
        if chunk.is_finish() {
            self.finished.store(true, Ordering::Release);
        }
        let kind = chunk.kind();
        if self.tx.send(chunk).await.is_err() {
            debug!(sub_chat_id = %self.sub_chat_id, kind, "no chunk receiver, dropped");
            return false;
        }
        true
    }

    /// Like [`emit`](Self::emit), but stops waiting for channel capacity once
    /// `cancel` fires. A consumer that is connected but not reading cannot
    /// hold the turn past its cancellation. Returns whether the chunk was
    /// delivered.
    pub async fn emit_or_cancel(&self, chunk: Chunk, cancel: &CancellationToken) -> bool {
        if self.finished.load(Ordering::Acquire) {
            debug!(sub_chat_id = %self.sub_chat_id, kind = chunk.kind(), "chunk after finish dropped");
            return false;
        }
        let permit = tokio::select! {
            biased;
            permit = self.tx.reserve() => permit,
            _ = cancel.cancelled() => {
                debug!(sub_chat_id = %self.sub_chat_id, kind = chunk.kind(), "turn cancelled while consumer was full, chunk dropped");
                return false;
            }
        };
        match permit {
            Ok(permit) => {
                if chunk.is_finish() {
                    self.finished.store(true, Ordering::Release);
                }
                permit.send(chunk);
                true
            }
            Err(_) => {
                debug!(sub_chat_id = %self.sub_chat_id, kind = chunk.kind(), "no chunk receiver, dropped");
                false
            }
        }
    }

    /// Resolves once the receiving side is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
