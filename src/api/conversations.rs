//! Conversations endpoints

use crate::api::ApiError;
use crate::api::conversations::schemas::{ConversationList, CreateConversation, CreateMessage};
use crate::core::engine::EngineError;
use crate::core::engine::events::{EventSink, SubProcessEvent};
use crate::core::traits::{ChatEngineFactory, ConversationService};
use crate::infrastructure::entities::{ConversationDetail, Message, MessageStatus};
use async_stream::stream;
use axum::extract::Path;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::get;
use axum::{Json, Router};
use di::Ref;
use di_axum::Inject;
use futures_util::Stream;
use log::{error, info};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conversations).post(new_conversation))
        .route("/:id", get(get_conversation))
        .route(
            "/:id/messages",
            get(conversation_messages).post(post_message),
        )
}

async fn list_conversations(
    Inject(conversation_service): Inject<dyn ConversationService>,
) -> Result<Json<ConversationList>, ApiError> {
    let conversations = conversation_service.list_conversations().await?;

    Ok(Json(ConversationList {
        conversations: conversations
            .into_iter()
            .map(schemas::Conversation::from)
            .collect(),
    }))
}

async fn new_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Json(create_conversation): Json<CreateConversation>,
) -> Result<Json<schemas::ConversationDetail>, ApiError> {
    let conversation = conversation_service
        .create_conversation(create_conversation.document_ids)
        .await?;

    Ok(Json(conversation.into()))
}

async fn get_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<schemas::ConversationDetail>, ApiError> {
    let conversation = conversation_service
        .get_conversation(conversation_id)
        .await?;

    Ok(Json(conversation.into()))
}

async fn conversation_messages(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<schemas::MessagesList>, ApiError> {
    let messages = conversation_service.list_messages(conversation_id).await?;

    Ok(Json(schemas::MessagesList {
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn post_message(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(chat_engine_factory): Inject<dyn ChatEngineFactory>,
    Path(conversation_id): Path<Uuid>,
    Json(message): Json<CreateMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if message.text.trim().is_empty() {
        return Err(ApiError::bad_request("message text must not be empty"));
    }

    // the turn's history is the conversation before this message
    let conversation = conversation_service
        .get_conversation(conversation_id)
        .await?;
    let user_message = conversation_service
        .create_user_message(conversation_id, message.text.clone())
        .await?;
    let assistant_message = conversation_service
        .create_pending_assistant_message(conversation_id)
        .await?;

    Ok(save_message_and_generate_response(
        conversation_service,
        chat_engine_factory,
        conversation,
        user_message,
        assistant_message.id,
        message.text,
    ))
}

enum Step {
    SubProcess(SubProcessEvent),
    Part(String),
    Done(Result<String, EngineError>),
}

async fn generate_response(
    chat_engine_factory: Ref<dyn ChatEngineFactory>,
    conversation: ConversationDetail,
    text: String,
    events: EventSink,
    deltas: mpsc::Sender<String>,
) -> Result<String, EngineError> {
    let agent = chat_engine_factory
        .get_chat_engine(&conversation, events)
        .await?;
    agent.stream_chat(&text, deltas).await
}

fn sse_event<T: Serialize>(name: &'static str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            error!("failed to serialize {name} event: {e}");
            Event::default().event(name)
        })
}

fn save_message_and_generate_response(
    conversation_service: Ref<dyn ConversationService>,
    chat_engine_factory: Ref<dyn ChatEngineFactory>,
    conversation: ConversationDetail,
    user_message: Message,
    message_id: Uuid,
    text: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let conversation_id = conversation.conversation.id;

    let stream = stream! {
        yield Ok(sse_event("new_message", &schemas::Message::from(user_message)));

        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        let (delta_sender, mut delta_receiver) = mpsc::channel(64);
        let generation = generate_response(
            chat_engine_factory,
            conversation,
            text,
            EventSink::new(event_sender),
            delta_sender,
        );
        tokio::pin!(generation);

        let mut assistant_message = String::new();
        let result = loop {
            let step = tokio::select! {
                biased;
                Some(event) = event_receiver.recv() => Step::SubProcess(event),
                Some(part) = delta_receiver.recv() => Step::Part(part),
                result = &mut generation => Step::Done(result),
            };

            match step {
                Step::SubProcess(event) => {
                    if let Err(e) = conversation_service.record_sub_process(message_id, &event).await {
                        error!("failed to record sub process for {message_id}: {e}");
                    }
                    yield Ok(sse_event("sub_process", &schemas::SubProcess::new(message_id, event)));
                }
                Step::Part(message_part) => {
                    assistant_message.push_str(&message_part);
                    yield Ok(Event::default()
                        .event("message_part")
                        .retry(Duration::from_millis(100))
                        .json_data(schemas::MessagePart {
                            conversation_id,
                            message_id,
                            message_part,
                        })
                        .unwrap_or_else(|_| Event::default().event("message_part")));
                }
                Step::Done(result) => break result,
            }
        };

        // output sent in the same poll that finished the pipeline
        while let Ok(message_part) = delta_receiver.try_recv() {
            assistant_message.push_str(&message_part);
            yield Ok(sse_event("message_part", &schemas::MessagePart {
                conversation_id,
                message_id,
                message_part,
            }));
        }
        while let Ok(event) = event_receiver.try_recv() {
            if let Err(e) = conversation_service.record_sub_process(message_id, &event).await {
                error!("failed to record sub process for {message_id}: {e}");
            }
            yield Ok(sse_event("sub_process", &schemas::SubProcess::new(message_id, event)));
        }

        match result {
            Ok(answer) => {
                info!("message {message_id} completed");
                match conversation_service
                    .update_message(message_id, MessageStatus::Success, answer)
                    .await
                {
                    Ok(message) => yield Ok(sse_event("message_done", &schemas::Message::from(message))),
                    Err(e) => {
                        error!("failed to save assistant message {message_id}: {e}");
                        yield Ok(sse_event("message_error", &schemas::MessageError {
                            conversation_id,
                            message_id,
                            error: e.to_string(),
                        }));
                    }
                }
            }
            Err(e) => {
                error!("failed to generate response for {message_id}: {e}");
                if let Err(e) = conversation_service
                    .update_message(message_id, MessageStatus::Error, assistant_message)
                    .await
                {
                    error!("failed to mark message {message_id} as failed: {e}");
                }
                yield Ok(sse_event("message_error", &schemas::MessageError {
                    conversation_id,
                    message_id,
                    error: e.to_string(),
                }));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub mod schemas {
    use crate::core::engine::events::SubProcessEvent;
    use crate::infrastructure::entities;
    use crate::infrastructure::entities::{
        MessageRole, MessageStatus, SubProcessSource, SubProcessStatus,
    };
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug, Default)]
    pub struct CreateConversation {
        #[serde(default)]
        pub document_ids: Vec<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct Conversation {
        pub id: Uuid,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl From<entities::Conversation> for Conversation {
        fn from(conversation: entities::Conversation) -> Self {
            Conversation {
                id: conversation.id,
                created_at: conversation.created_at,
                updated_at: conversation.updated_at,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationList {
        pub conversations: Vec<Conversation>,
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationDetail {
        pub id: Uuid,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
        pub messages: Vec<Message>,
        pub documents: Vec<String>,
    }

    impl From<entities::ConversationDetail> for ConversationDetail {
        fn from(detail: entities::ConversationDetail) -> Self {
            ConversationDetail {
                id: detail.conversation.id,
                created_at: detail.conversation.created_at,
                updated_at: detail.conversation.updated_at,
                messages: detail.messages.into_iter().map(Message::from).collect(),
                documents: detail.documents,
            }
        }
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Debug)]
    pub struct Message {
        pub conversation_id: Uuid,
        pub id: Uuid,
        pub role: MessageRole,
        pub status: MessageStatus,
        pub content: String,
        pub created_at: DateTime<Utc>,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                conversation_id: message.conversation_id,
                id: message.id,
                role: message.role,
                status: message.status,
                content: message.content,
                created_at: message.created_at,
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct CreateMessage {
        pub text: String,
    }

    #[derive(Serialize, Debug)]
    pub struct MessagePart {
        pub conversation_id: Uuid,
        pub message_id: Uuid,
        pub message_part: String,
    }

    #[derive(Serialize, Debug)]
    pub struct MessageError {
        pub conversation_id: Uuid,
        pub message_id: Uuid,
        pub error: String,
    }

    #[derive(Serialize, Debug)]
    pub struct SubProcess {
        pub event_id: Uuid,
        pub message_id: Uuid,
        pub source: SubProcessSource,
        pub status: SubProcessStatus,
        pub metadata_map: serde_json::Value,
    }

    impl SubProcess {
        pub fn new(message_id: Uuid, event: SubProcessEvent) -> Self {
            SubProcess {
                event_id: event.event_id,
                message_id,
                source: event.source,
                status: event.status,
                metadata_map: event.metadata,
            }
        }
    }
}
