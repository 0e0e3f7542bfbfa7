use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
