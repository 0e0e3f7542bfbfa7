//! Chat history reconstruction from stored messages.

use crate::infrastructure::entities::{Message, MessageRole, MessageStatus};
use crate::infrastructure::llm::{ChatMessage, Role};

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        ChatMessage::new(
            match m.role {
                MessageRole::Assistant => Role::Assistant,
                MessageRole::User => Role::User,
            },
            m.content.clone(),
        )
    }
}

/// Builds the prompt history of a conversation.
///
/// Only successful messages with non-blank content take part, oldest first.
pub fn get_chat_history(messages: &[Message]) -> Vec<ChatMessage> {
    let mut messages: Vec<&Message> = messages
        .iter()
        .filter(|m| !m.content.trim().is_empty() && m.status == MessageStatus::Success)
        .collect();
    // stable, so equal timestamps keep their stored order
    messages.sort_by_key(|m| m.created_at);

    messages.into_iter().map(ChatMessage::from).collect()
}
