//! Message and Transcript domain types.
//!
//! The transcript is what the operator sees: task submissions, streamed
//! assistant output, agent progress notes, and system-level failures.
//! It is append-only; the only in-place mutation allowed is on the message
//! currently tagged [`MessageState::Streaming`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolInvocation;

/// The role of a message sender in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The operator
    User,
    /// The completion service
    Assistant,
    /// The engine itself (plans, step progress, summaries)
    Agent,
    /// Errors and notices not attributable to a stream
    System,
}

/// Whether a message may still be mutated by the streaming router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Streaming,
    #[default]
    Resolved,
}

/// A single message in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who produced this message
    pub role: Role,

    /// The rendered text content
    pub content: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Tool calls observed while this message streamed (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// Streaming or resolved
    #[serde(default)]
    pub state: MessageState,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            state: MessageState::Resolved,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new agent (engine) message.
    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create an empty assistant message that is open for streaming.
    pub fn streaming() -> Self {
        let mut msg = Self::new(Role::Assistant, "");
        msg.state = MessageState::Streaming;
        msg
    }

    pub fn is_streaming(&self) -> bool {
        self.state == MessageState::Streaming
    }
}

/// One turn of conversation history sent along with each `chat_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The append-only, operator-visible record of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns its ID.
    pub fn push(&mut self, message: Message) -> String {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// Look up a message by ID.
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Mutable access to a message that is still streaming.
    ///
    /// Resolved messages are immutable; asking for one returns `None`.
    pub fn streaming_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.id == id)
            .filter(|m| m.is_streaming())
    }

    /// The most recent message sent by the operator.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Resolved user and assistant turns, oldest first, as sent with each request.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.messages
            .iter()
            .filter(|m| !m.is_streaming() && matches!(m.role, Role::User | Role::Assistant))
            .map(|m| HistoryEntry::new(m.role, m.content.clone()))
            .collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every message. Agent state is unaffected.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert_eq!(msg.state, MessageState::Resolved);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn streaming_message_is_mutable_until_resolved() {
        let mut transcript = Transcript::new();
        let id = transcript.push(Message::streaming());

        transcript.streaming_mut(&id).unwrap().content.push_str("partial");
        assert_eq!(transcript.get(&id).unwrap().content, "partial");

        transcript.streaming_mut(&id).unwrap().state = MessageState::Resolved;
        assert!(transcript.streaming_mut(&id).is_none());
    }

    #[test]
    fn resolved_messages_are_not_handed_out_for_mutation() {
        let mut transcript = Transcript::new();
        let id = transcript.push(Message::assistant("done"));
        assert!(transcript.streaming_mut(&id).is_none());
    }

    #[test]
    fn last_user_message_skips_other_roles() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user("first"));
        transcript.push(Message::user("second"));
        transcript.push(Message::assistant("reply"));
        transcript.push(Message::system("notice"));
        assert_eq!(transcript.last_user_message().unwrap().content, "second");
    }

    #[test]
    fn history_skips_streaming_and_engine_messages() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user("task"));
        transcript.push(Message::agent("plan"));
        transcript.push(Message::assistant("answer"));
        transcript.push(Message::streaming());

        let history = transcript.history();
        assert_eq!(
            history,
            vec![
                HistoryEntry::new(Role::User, "task"),
                HistoryEntry::new(Role::Assistant, "answer"),
            ]
        );
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Agent).unwrap();
        assert_eq!(json, r#""agent""#);
    }

    #[test]
    fn clear_empties_transcript() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user("x"));
        transcript.clear();
        assert!(transcript.is_empty());
    }
}
