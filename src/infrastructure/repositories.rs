//! DB Repository abstractions

use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{
    Conversation, ConversationDocument, Message, MessageStatus, MessageSubProcess,
};
use crate::infrastructure::traits::ConversationRepository;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::error;
use uuid::Uuid;

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conversations ORDER BY datetime(created_at) ASC")
            .fetch_all(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))
    }

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))
    }

    async fn create_conversation(
        &self,
        conversation: Conversation,
        document_ids: &[String],
    ) -> Result<Conversation, sqlx::Error> {
        let mut transaction = self.connection.begin().await?;

        let created: Conversation = sqlx::query_as(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(conversation.id)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .fetch_one(&mut *transaction)
        .await
        .inspect_err(|e| error!("{e}"))?;

        for document_id in document_ids {
            sqlx::query(
                "INSERT INTO conversation_documents (id, conversation_id, document_id) VALUES (?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(created.id)
            .bind(document_id)
            .execute(&mut *transaction)
            .await
            .inspect_err(|e| error!("{e}"))?;
        }

        transaction.commit().await?;
        Ok(created)
    }

    async fn list_conversation_documents(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationDocument>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM conversation_documents WHERE conversation_id = ? ORDER BY rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY datetime(created_at) ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))
    }

    async fn create_message(&self, message: Message) -> Result<Message, sqlx::Error> {
        let created: Message = sqlx::query_as(
            "INSERT INTO messages (id, conversation_id, role, status, content, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.role)
        .bind(message.status)
        .bind(message.content)
        .bind(message.created_at)
        .fetch_one(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(created.created_at)
            .bind(created.conversation_id)
            .execute(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))?;

        Ok(created)
    }

    async fn update_message(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        content: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as("UPDATE messages SET status = ?, content = ? WHERE id = ? RETURNING *")
            .bind(status)
            .bind(content)
            .bind(message_id)
            .fetch_optional(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))
    }

    async fn create_sub_process(
        &self,
        sub_process: MessageSubProcess,
    ) -> Result<MessageSubProcess, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO message_sub_processes (id, message_id, source, status, metadata_map, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(sub_process.id)
        .bind(sub_process.message_id)
        .bind(sub_process.source)
        .bind(sub_process.status)
        .bind(sub_process.metadata_map)
        .bind(sub_process.created_at)
        .fetch_one(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))
    }

    async fn list_sub_processes(
        &self,
        message_id: Uuid,
    ) -> Result<Vec<MessageSubProcess>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM message_sub_processes WHERE message_id = ? ORDER BY datetime(created_at) ASC, rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))
    }
}
