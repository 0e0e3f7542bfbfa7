//! Database entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link between a conversation and a document identifier.
#[derive(Debug, Clone, FromRow)]
pub struct ConversationDocument {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub document_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Every kind of auxiliary event recorded while an assistant message is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SubProcessSource {
    Chunking,
    NodeParsing,
    Embedding,
    Llm,
    Query,
    Retrieve,
    Synthesize,
    Tree,
    SubQuestion,
    Templating,
    FunctionCall,
    Reranking,
    Exception,
    AgentStep,
    ConstructedQueryEngine,
    SubQuestions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum SubProcessStatus {
    Pending,
    Finished,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageSubProcess {
    pub id: Uuid,
    pub message_id: Uuid,
    pub source: SubProcessSource,
    pub status: SubProcessStatus,
    pub metadata_map: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

/// A conversation together with its messages and selected documents.
#[derive(Debug, Clone)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub documents: Vec<String>,
}
