//! DI "Interfaces"

use crate::core::engine::EngineError;
use crate::core::engine::agent::ChatAgent;
use crate::core::engine::events::{EventSink, SubProcessEvent};
use crate::core::error::ServiceError;
use crate::infrastructure::entities;
use crate::infrastructure::entities::{MessageRole, MessageStatus};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Lists all conversations, oldest first.
    async fn list_conversations(&self) -> Result<Vec<entities::Conversation>, ServiceError>;

    /// Creates a new conversation over the given documents.
    async fn create_conversation(
        &self,
        document_ids: Vec<String>,
    ) -> Result<entities::ConversationDetail, ServiceError>;

    /// Loads a conversation with its messages and selected documents.
    ///
    /// Returns `ConversationNotFound` if it doesn't exist.
    async fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<entities::ConversationDetail, ServiceError>;

    /// List all messages in a conversation.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<entities::Message>, ServiceError>;

    /// Creates a new message in a conversation.
    ///
    /// The helper functions `create_X_message` should be used instead for clarity.
    async fn create_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        status: MessageStatus,
        content: String,
    ) -> Result<entities::Message, ServiceError>;

    /// Stores a finished user message.
    async fn create_user_message(
        &self,
        conversation_id: Uuid,
        content: String,
    ) -> Result<entities::Message, ServiceError> {
        self.create_message(
            conversation_id,
            MessageRole::User,
            MessageStatus::Success,
            content,
        )
        .await
    }

    /// Stores an empty assistant message to be filled in once generation ends.
    async fn create_pending_assistant_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<entities::Message, ServiceError> {
        self.create_message(
            conversation_id,
            MessageRole::Assistant,
            MessageStatus::Pending,
            String::new(),
        )
        .await
    }

    async fn update_message(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        content: String,
    ) -> Result<entities::Message, ServiceError>;

    /// Appends a sub-process event to the message's record.
    async fn record_sub_process(
        &self,
        message_id: Uuid,
        event: &SubProcessEvent,
    ) -> Result<entities::MessageSubProcess, ServiceError>;
}

#[async_trait]
pub trait ChatEngineFactory: Send + Sync {
    /// Assembles the chat agent answering within the given conversation.
    async fn get_chat_engine(
        &self,
        conversation: &entities::ConversationDetail,
        events: EventSink,
    ) -> Result<ChatAgent, EngineError>;
}
