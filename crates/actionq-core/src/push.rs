use std::collections::HashSet;
use std::sync::RwLock;

/// One-shot sticky flags for externally signalled events.
///
/// Once an event id is signalled it stays signalled for the life of the
/// board; `push-event` effects only ever read it.
#[derive(Debug, Default)]
pub struct PushEventBoard {
    signaled: RwLock<HashSet<String>>,
}

impl PushEventBoard {
    /// Returns `true` if the event was not already signalled.
    pub fn signal(&self, event_id: &str) -> bool {
        let mut set = self.signaled.write().unwrap_or_else(|e| e.into_inner());
        set.insert(event_id.to_string())
    }

    pub fn is_signaled(&self, event_id: &str) -> bool {
        let set = self.signaled.read().unwrap_or_else(|e| e.into_inner());
        set.contains(event_id)
    }

    /// Merge event ids signalled elsewhere (e.g. loaded from the queue db).
    pub fn extend<I>(&self, event_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = self.signaled.write().unwrap_or_else(|e| e.into_inner());
        set.extend(event_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_sticky_and_reports_first_time() {
        let board = PushEventBoard::default();
        assert!(!board.is_signaled("ev"));
        assert!(board.signal("ev"));
        assert!(!board.signal("ev"));
        assert!(board.is_signaled("ev"));
    }

    #[test]
    fn extend_merges_ids() {
        let board = PushEventBoard::default();
        board.extend(vec!["a".to_string(), "b".to_string()]);
        assert!(board.is_signaled("a"));
        assert!(board.is_signaled("b"));
        assert!(!board.is_signaled("c"));
    }
}
