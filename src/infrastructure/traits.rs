//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use crate::infrastructure::llm::{Completion, CompletionRequest, LlmError};
use crate::infrastructure::vector_store::{EmbeddedNode, ScoredNode, StoreError, VectorStoreQuery};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;
use uuid::Uuid;

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<entities::Conversation>, sqlx::Error>;

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<entities::Conversation>, sqlx::Error>;

    /// Inserts the conversation and its document links in one transaction.
    async fn create_conversation(
        &self,
        conversation: entities::Conversation,
        document_ids: &[String],
    ) -> Result<entities::Conversation, sqlx::Error>;

    async fn list_conversation_documents(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<entities::ConversationDocument>, sqlx::Error>;

    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<entities::Message>, sqlx::Error>;

    async fn create_message(
        &self,
        message: entities::Message,
    ) -> Result<entities::Message, sqlx::Error>;

    async fn update_message(
        &self,
        message_id: Uuid,
        status: entities::MessageStatus,
        content: &str,
    ) -> Result<Option<entities::Message>, sqlx::Error>;

    async fn create_sub_process(
        &self,
        sub_process: entities::MessageSubProcess,
    ) -> Result<entities::MessageSubProcess, sqlx::Error>;

    async fn list_sub_processes(
        &self,
        message_id: Uuid,
    ) -> Result<Vec<entities::MessageSubProcess>, sqlx::Error>;
}

/// Chat-completion provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;

    /// Streams a completion, forwarding text deltas to `deltas` as they arrive.
    ///
    /// Tool calls are accumulated and returned with the final completion. A closed
    /// receiver does not abort the request.
    async fn stream(
        &self,
        request: CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError>;
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, nodes: Vec<EmbeddedNode>) -> Result<(), StoreError>;

    /// Removes every node that belongs to the given source document.
    async fn delete_document(&self, ref_doc_id: &str) -> Result<(), StoreError>;

    async fn query(&self, query: &VectorStoreQuery) -> Result<Vec<ScoredNode>, StoreError>;

    /// Whether every one of the given nodes is stored.
    async fn contains_all(&self, node_ids: &[String]) -> bool;

    async fn persist(&self, persist_dir: &Path) -> Result<(), StoreError>;
}
