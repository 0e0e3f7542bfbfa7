//! Document question-answering pipeline.
//!
//! Per-document vector indices are turned into query-engine tools, wrapped in
//! a sub-question engine, and handed to a function-calling chat agent that
//! answers the user with streaming output.

pub mod agent;
pub mod events;
pub mod index;
pub mod loader;
pub mod query_engine;
pub mod storage;
pub mod sub_question;

use crate::core::history::get_chat_history;
use crate::core::prompts;
use crate::core::traits::ChatEngineFactory;
use crate::infrastructure::entities::{ConversationDetail, Message, SubProcessSource};
use crate::infrastructure::llm::LlmError;
use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::{EmbeddingClient, LlmClient};
use crate::infrastructure::vector_store::StoreError;
use agent::{ChatAgent, MAX_FUNCTION_CALLS};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use events::EventSink;
use index::{IndexBuilder, IndexError};
use loader::LoaderError;
use log::info;
use query_engine::{QueryEngineTool, ToolMetadata, index_to_query_engine};
use serde_json::json;
use std::sync::Arc;
use storage::StorageError;
use sub_question::{SubQuestionGenerator, SubQuestionQueryEngine};
use thiserror::Error;

/// Name of the single tool the chat agent is given.
pub const QUALITATIVE_ENGINE_NAME: &str = "qualitative_question_engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    VectorStore(#[from] StoreError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("prompt template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("tool with name {0} not found")]
    UnknownTool(String),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Models, chunking parameters and the event sink shared by every pipeline
/// component of one request.
#[derive(Clone)]
pub struct ServiceContext {
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub events: EventSink,
}

impl ServiceContext {
    pub fn from_settings(
        settings: &Settings,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        events: EventSink,
    ) -> Self {
        ServiceContext {
            llm,
            embedder,
            model: settings.chat_model.clone(),
            chunk_size: settings.chunk_size,
            chunk_overlap: settings.chunk_overlap,
            events,
        }
    }
}

/// The part of a document id before its first `.`; the whole id when there is none.
pub fn display_name(doc_id: &str) -> &str {
    doc_id.split('.').next().unwrap_or(doc_id)
}

/// Assembles the chat agent for a conversation.
///
/// Every selected document becomes a tool named by its display name; those
/// tools sit behind one sub-question engine, which is the agent's only tool.
pub async fn get_chat_engine(
    service_context: ServiceContext,
    index_builder: &IndexBuilder,
    documents: &[String],
    messages: &[Message],
) -> Result<ChatAgent, EngineError> {
    let mut doc_ids: Vec<String> = Vec::with_capacity(documents.len());
    for doc_id in documents {
        if !doc_ids.contains(doc_id) {
            doc_ids.push(doc_id.clone());
        }
    }

    let doc_id_to_index = index_builder
        .build_doc_id_to_index_map(&service_context, &doc_ids)
        .await?;

    let mut tools = Vec::with_capacity(doc_ids.len());
    for doc_id in &doc_ids {
        let Some(index) = doc_id_to_index.get(doc_id) else {
            continue;
        };
        let name = display_name(doc_id);
        tools.push(QueryEngineTool {
            metadata: ToolMetadata {
                name: name.to_owned(),
                description: prompts::document_tool_description(name)?,
            },
            query_engine: Arc::new(index_to_query_engine(doc_id, index.clone())),
        });
    }

    let display_names: Vec<String> = doc_ids
        .iter()
        .map(|doc_id| display_name(doc_id).to_owned())
        .collect();
    let doc_titles = prompts::document_titles(&display_names);

    let generator =
        SubQuestionGenerator::new(service_context.llm.clone(), service_context.model.clone());
    let qualitative_engine = SubQuestionQueryEngine::new(
        tools,
        generator,
        service_context.clone(),
        doc_titles.clone(),
    );
    let top_level_tool = QueryEngineTool {
        metadata: ToolMetadata {
            name: QUALITATIVE_ENGINE_NAME.to_owned(),
            description: prompts::QUALITATIVE_ENGINE_DESCRIPTION.to_owned(),
        },
        query_engine: Arc::new(qualitative_engine),
    };

    let curr_date = Utc::now().format("%Y-%m-%d").to_string();
    let system_prompt = prompts::system_prompt(&doc_titles, &curr_date)?;

    service_context.events.finished(
        SubProcessSource::ConstructedQueryEngine,
        json!({ "documents": doc_ids }),
    );
    info!("constructed chat engine over {} documents", doc_ids.len());

    Ok(ChatAgent::new(
        vec![top_level_tool],
        service_context.llm.clone(),
        service_context.model.clone(),
        get_chat_history(messages),
        system_prompt,
        service_context.events.clone(),
    )
    .with_max_function_calls(MAX_FUNCTION_CALLS))
}

#[injectable(ChatEngineFactory)]
pub struct DocumentChatEngineFactory {
    settings: Ref<Settings>,
    llm: Ref<dyn LlmClient>,
    embedder: Ref<dyn EmbeddingClient>,
    index_builder: Ref<IndexBuilder>,
}

#[async_trait]
impl ChatEngineFactory for DocumentChatEngineFactory {
    async fn get_chat_engine(
        &self,
        conversation: &ConversationDetail,
        events: EventSink,
    ) -> Result<ChatAgent, EngineError> {
        let service_context = ServiceContext::from_settings(
            &self.settings,
            self.llm.clone(),
            self.embedder.clone(),
            events,
        );

        get_chat_engine(
            service_context,
            &self.index_builder,
            &conversation.documents,
            &conversation.messages,
        )
        .await
    }
}
