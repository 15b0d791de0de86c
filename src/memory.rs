use dashmap::DashMap;

use crate::models::{ChatMessage, Role};

/// Turns kept per session; older ones fall off the front.
const MAX_TURNS_PER_SESSION: usize = 40;

/// In-memory conversation history keyed by session id.
#[derive(Default)]
pub struct ChatMemory {
    sessions: DashMap<String, Vec<ChatMessage>>,
}

impl ChatMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions.get(session_id).map(|h| h.clone()).unwrap_or_default()
    }

    pub fn add_user(&self, session_id: &str, content: impl Into<String>) {
        self.push(session_id, Role::User, content.into());
    }

    pub fn add_assistant(&self, session_id: &str, content: impl Into<String>) {
        self.push(session_id, Role::Assistant, content.into());
    }

    fn push(&self, session_id: &str, role: Role, content: String) {
        let mut turns = self.sessions.entry(session_id.to_string()).or_default();
        turns.push(ChatMessage { role, content });
        if turns.len() > MAX_TURNS_PER_SESSION {
            let excess = turns.len() - MAX_TURNS_PER_SESSION;
            turns.drain(..excess);
        }
    }

    pub fn last_assistant(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).and_then(|turns| {
            turns
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
        })
    }

    /// Returns whether the session existed.
    pub fn clear(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_are_ordered_per_session() {
        let memory = ChatMemory::new();
        memory.add_user("a", "hi");
        memory.add_user("b", "other session");
        memory.add_assistant("a", "hello");

        let history = memory.history("a");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "hello");
        assert_eq!(memory.last_assistant("a").as_deref(), Some("hello"));
        assert_eq!(memory.last_assistant("b"), None);
    }

    #[test]
    fn test_history_is_capped() {
        let memory = ChatMemory::new();
        for i in 0..(MAX_TURNS_PER_SESSION + 5) {
            memory.add_user("s", format!("msg {i}"));
        }
        let history = memory.history("s");
        assert_eq!(history.len(), MAX_TURNS_PER_SESSION);
        assert_eq!(history[0].content, "msg 5");
    }

    #[test]
    fn test_clear() {
        let memory = ChatMemory::new();
        memory.add_user("s", "x");
        assert!(memory.clear("s"));
        assert!(!memory.clear("s"));
        assert!(memory.history("s").is_empty());
        assert_eq!(memory.session_count(), 0);
    }
}
