//! Context builder for assembling the conversation window

use serde::Deserialize;

use crate::Result;
use crate::db::{HistoryEntry, SessionStore};
use crate::llm::ChatMessage;

/// Configuration for context building
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum number of prior exchanges fed to the model
    pub max_exchanges: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { max_exchanges: 10 }
    }
}

/// Ordered recent history, oldest first, alternating user and assistant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextWindow {
    messages: Vec<ChatMessage>,
}

impl ContextWindow {
    /// Window from history entries already in chronological order
    #[must_use]
    pub fn from_history(history: Vec<HistoryEntry>) -> Self {
        let messages = history
            .into_iter()
            .flat_map(|entry| [ChatMessage::user(entry.user), ChatMessage::assistant(entry.bot)])
            .collect();
        Self { messages }
    }

    /// Messages in the window
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages (two per exchange)
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the window holds no history
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Full request list: system prompt, history, then the new user message
    #[must_use]
    pub fn to_chat_messages(&self, system_prompt: &str, user_text: &str) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        if !system_prompt.is_empty() {
            out.push(ChatMessage::system(system_prompt));
        }
        out.extend(self.messages.iter().cloned());
        out.push(ChatMessage::user(user_text));
        out
    }

    /// History plus the new user message, without a system prompt
    #[must_use]
    pub fn with_user_message(&self, user_text: &str) -> Vec<ChatMessage> {
        self.to_chat_messages("", user_text)
    }
}

/// Builds the context window for each turn
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a new context builder
    #[must_use]
    pub const fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Window size in exchanges
    #[must_use]
    pub const fn max_exchanges(&self) -> usize {
        self.config.max_exchanges
    }

    /// Build the window for a session from one bounded read of the store
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn build(&self, store: &SessionStore, session_id: &str) -> Result<ContextWindow> {
        let history = store.get_history(session_id, self.config.max_exchanges)?;
        let window = ContextWindow::from_history(history);

        tracing::debug!(
            session_id,
            messages = window.len(),
            max_exchanges = self.config.max_exchanges,
            "context built"
        );
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::llm::ChatRole;

    fn setup() -> (SessionStore, String) {
        let store = SessionStore::new(db::init_memory().unwrap());
        let session_id = store.create_session(Some("test")).unwrap();
        (store, session_id)
    }

    #[test]
    fn test_empty_session_builds_empty_window() {
        let (store, session_id) = setup();
        let window = ContextBuilder::default().build(&store, &session_id).unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_unknown_session_builds_empty_window() {
        let (store, _) = setup();
        let window = ContextBuilder::default().build(&store, "session_missing").unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_alternates_oldest_first() {
        let (store, session_id) = setup();
        store.save_exchange(&session_id, "一", "いち", None, None).unwrap();
        store.save_exchange(&session_id, "二", "に", None, None).unwrap();

        let window = ContextBuilder::default().build(&store, &session_id).unwrap();
        let contents: Vec<_> = window.messages().iter().map(|m| m.content.as_str()).collect();
        let roles: Vec<_> = window.messages().iter().map(|m| m.role).collect();

        assert_eq!(contents, vec!["一", "いち", "二", "に"]);
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]
        );
    }

    #[test]
    fn test_window_is_capped_to_most_recent() {
        let (store, session_id) = setup();
        for i in 0..5 {
            store
                .save_exchange(&session_id, &format!("質問{i}"), &format!("回答{i}"), None, None)
                .unwrap();
        }

        let builder = ContextBuilder::new(ContextConfig { max_exchanges: 2 });
        let window = builder.build(&store, &session_id).unwrap();

        assert_eq!(window.len(), 4);
        assert_eq!(window.messages()[0].content, "質問3");
        assert_eq!(window.messages()[3].content, "回答4");
    }

    #[test]
    fn test_to_chat_messages_wraps_history() {
        let (store, session_id) = setup();
        store.save_exchange(&session_id, "こんにちは", "こんにちは！", None, None).unwrap();

        let window = ContextBuilder::default().build(&store, &session_id).unwrap();
        let messages = window.to_chat_messages("あなたは親切なアシスタントです。", "元気？");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[3], ChatMessage::user("元気？"));
        assert_eq!(window.with_user_message("元気？").len(), 3);
    }

    #[test]
    fn test_zero_window_reads_nothing() {
        let (store, session_id) = setup();
        store.save_exchange(&session_id, "a", "b", None, None).unwrap();

        let window = ContextBuilder::new(ContextConfig { max_exchanges: 0 })
            .build(&store, &session_id)
            .unwrap();
        assert!(window.is_empty());
    }
}
