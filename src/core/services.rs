//! Implementations for the service the app needs.
//!

use crate::core::engine::events::SubProcessEvent;
use crate::core::engine::loader::is_valid_document_id;
use crate::core::error::ServiceError;
use crate::core::traits::ConversationService;
use crate::infrastructure::entities::{
    Conversation, ConversationDetail, Message, MessageRole, MessageStatus, MessageSubProcess,
};
use crate::infrastructure::traits::ConversationRepository;
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use sqlx::types::Json;
use uuid::Uuid;

#[injectable(ConversationService)]
pub struct DbConversationService {
    repo: Ref<dyn ConversationRepository>,
}

impl DbConversationService {
    async fn ensure_conversation(&self, conversation_id: Uuid) -> Result<Conversation, ServiceError> {
        self.repo
            .find_conversation(conversation_id)
            .await?
            .ok_or(ServiceError::ConversationNotFound(conversation_id))
    }
}

#[async_trait]
impl ConversationService for DbConversationService {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ServiceError> {
        Ok(self.repo.list_conversations().await?)
    }

    async fn create_conversation(
        &self,
        document_ids: Vec<String>,
    ) -> Result<ConversationDetail, ServiceError> {
        if let Some(invalid) = document_ids.iter().find(|id| !is_valid_document_id(id)) {
            return Err(ServiceError::InvalidDocumentId(invalid.clone()));
        }

        let now = Utc::now();
        let conversation = self
            .repo
            .create_conversation(
                Conversation {
                    id: Uuid::new_v4(),
                    created_at: now,
                    updated_at: now,
                },
                &document_ids,
            )
            .await?;

        Ok(ConversationDetail {
            conversation,
            messages: Vec::new(),
            documents: document_ids,
        })
    }

    async fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<ConversationDetail, ServiceError> {
        let conversation = self.ensure_conversation(conversation_id).await?;
        let messages = self.repo.list_conversation_messages(conversation_id).await?;
        let documents = self
            .repo
            .list_conversation_documents(conversation_id)
            .await?
            .into_iter()
            .map(|document| document.document_id)
            .collect();

        Ok(ConversationDetail {
            conversation,
            messages,
            documents,
        })
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ServiceError> {
        self.ensure_conversation(conversation_id).await?;
        Ok(self.repo.list_conversation_messages(conversation_id).await?)
    }

    async fn create_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        status: MessageStatus,
        content: String,
    ) -> Result<Message, ServiceError> {
        self.ensure_conversation(conversation_id).await?;
        Ok(self
            .repo
            .create_message(Message {
                id: Uuid::new_v4(),
                conversation_id,
                role,
                status,
                content,
                created_at: Utc::now(),
            })
            .await?)
    }

    async fn update_message(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        content: String,
    ) -> Result<Message, ServiceError> {
        self.repo
            .update_message(message_id, status, &content)
            .await?
            .ok_or(ServiceError::MessageNotFound(message_id))
    }

    async fn record_sub_process(
        &self,
        message_id: Uuid,
        event: &SubProcessEvent,
    ) -> Result<MessageSubProcess, ServiceError> {
        Ok(self
            .repo
            .create_sub_process(MessageSubProcess {
                id: Uuid::new_v4(),
                message_id,
                source: event.source,
                status: event.status,
                metadata_map: Some(Json(event.metadata.clone())),
                created_at: Utc::now(),
            })
            .await?)
    }
}
