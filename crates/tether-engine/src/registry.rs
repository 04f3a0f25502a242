use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_core::ids::{SubChatId, TurnId};

/// Cancellation handle of one active turn.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    pub turn_id: TurnId,
    pub token: CancellationToken,
}

struct ActiveTurn {
    turn_id: TurnId,
    token: CancellationToken,
    started_at: Instant,
}

/// Active turns per sub-chat.
///
/// Starting a turn beyond the per-sub-chat limit cancels the oldest one.
/// A finishing turn only removes its own entry, so a late teardown never
/// clobbers a newer turn.
pub struct SessionRegistry {
    turns: DashMap<SubChatId, Vec<ActiveTurn>>,
    max_per_sub_chat: usize,
}

impl SessionRegistry {
    pub fn new(max_per_sub_chat: usize) -> Self {
        Self {
            turns: DashMap::new(),
            max_per_sub_chat: max_per_sub_chat.max(1),
        }
    }

    pub fn start(&self, sub_chat_id: &SubChatId) -> CancelHandle {
        let handle = CancelHandle {
            turn_id: TurnId::new(),
            token: CancellationToken::new(),
        };
        let evicted: Vec<ActiveTurn> = {
            let mut entry = self.turns.entry(sub_chat_id.clone()).or_default();
            entry.push(ActiveTurn {
                turn_id: handle.turn_id.clone(),
                token: handle.token.clone(),
                started_at: Instant::now(),
            });
            let excess = entry.len().saturating_sub(self.max_per_sub_chat);
            entry.drain(..excess).collect()
        };
        for turn in evicted {
            info!(
                sub_chat_id = %sub_chat_id,
                turn_id = %turn.turn_id,
                age_ms = turn.started_at.elapsed().as_millis() as u64,
                "superseding active turn"
            );
            turn.token.cancel();
        }
        handle
    }

    /// Cancel every active turn of a sub-chat. Returns whether anything was
    /// active.
    pub fn cancel(&self, sub_chat_id: &SubChatId) -> bool {
        match self.turns.remove(sub_chat_id) {
            Some((_, turns)) if !turns.is_empty() => {
                for turn in &turns {
                    turn.token.cancel();
                }
                info!(sub_chat_id = %sub_chat_id, count = turns.len(), "cancelled sub-chat");
                true
            }
            _ => false,
        }
    }

    /// Cancel one turn, leaving other turns of the sub-chat alone. Calling it
    /// again, or after the turn finished, returns false.
    pub fn cancel_turn(&self, sub_chat_id: &SubChatId, turn_id: &TurnId) -> bool {
        let mut cancelled = None;
        self.turns.remove_if_mut(sub_chat_id, |_, turns| {
            if let Some(pos) = turns.iter().position(|t| &t.turn_id == turn_id) {
                cancelled = Some(turns.remove(pos));
            }
            turns.is_empty()
        });
        match cancelled {
            Some(turn) => {
                turn.token.cancel();
                info!(sub_chat_id = %sub_chat_id, turn_id = %turn_id, "cancelled turn");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, sub_chat_id: &SubChatId) -> bool {
        self.turns
            .get(sub_chat_id)
            .is_some_and(|turns| !turns.is_empty())
    }

    /// Drop a turn's entry once it has torn down.
    pub fn finish(&self, sub_chat_id: &SubChatId, turn_id: &TurnId) {
        let emptied = self
            .turns
            .remove_if_mut(sub_chat_id, |_, turns| {
                turns.retain(|t| &t.turn_id != turn_id);
                turns.is_empty()
            })
            .is_some();
        debug!(sub_chat_id = %sub_chat_id, turn_id = %turn_id, emptied, "turn finished");
    }

    /// Cancel everything. Returns the number of cancelled turns.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.turns.iter() {
            for turn in entry.value() {
                turn.token.cancel();
                count += 1;
            }
        }
        self.turns.clear();
        count
    }

    pub fn active_count(&self) -> usize {
        self.turns.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_once() {
        let registry = SessionRegistry::new(1);
        let sub = SubChatId::from_raw("s");
        let handle = registry.start(&sub);
        assert!(registry.is_active(&sub));

        assert!(registry.cancel(&sub));
        assert!(handle.token.is_cancelled());
        assert!(!registry.cancel(&sub));
        assert!(!registry.is_active(&sub));
    }

    #[test]
    fn unknown_sub_chat_is_inactive() {
        let registry = SessionRegistry::new(1);
        assert!(!registry.cancel(&SubChatId::from_raw("none")));
        assert!(!registry.is_active(&SubChatId::from_raw("none")));
    }

    #[test]
    fn new_turn_supersedes_old_one() {
        let registry = SessionRegistry::new(1);
        let sub = SubChatId::from_raw("s");
        let first = registry.start(&sub);
        let second = registry.start(&sub);

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(registry.active_count(), 1);

        // The superseded turn's teardown leaves the new one registered.
        registry.finish(&sub, &first.turn_id);
        assert!(registry.is_active(&sub));
        registry.finish(&sub, &second.turn_id);
        assert!(!registry.is_active(&sub));
    }

    #[test]
    fn higher_limit_keeps_concurrent_turns() {
        let registry = SessionRegistry::new(2);
        let sub = SubChatId::from_raw("s");
        let a = registry.start(&sub);
        let b = registry.start(&sub);
        let c = registry.start(&sub);
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
        assert!(!c.token.is_cancelled());
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn sub_chats_are_independent() {
        let registry = SessionRegistry::new(1);
        let a = registry.start(&SubChatId::from_raw("a"));
        let b = registry.start(&SubChatId::from_raw("b"));
        assert!(registry.cancel(&SubChatId::from_raw("a")));
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
    }

    #[test]
    fn cancel_turn_is_scoped_and_idempotent() {
        let registry = SessionRegistry::new(2);
        let sub = SubChatId::from_raw("s");
        let a = registry.start(&sub);
        let b = registry.start(&sub);

        assert!(registry.cancel_turn(&sub, &a.turn_id));
        assert!(!registry.cancel_turn(&sub, &a.turn_id));
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
        assert!(registry.is_active(&sub));

        assert!(registry.cancel_turn(&sub, &b.turn_id));
        assert!(!registry.is_active(&sub));
    }

    #[test]
    fn cancel_all_counts_turns() {
        let registry = SessionRegistry::new(1);
        let a = registry.start(&SubChatId::from_raw("a"));
        let b = registry.start(&SubChatId::from_raw("b"));
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token.is_cancelled() && b.token.is_cancelled());
        assert_eq!(registry.active_count(), 0);
    }
}
