//! Query engines and the tools wrapping them.

use super::index::VectorIndex;
use super::loader::DB_DOC_ID_KEY;
use super::EngineError;
use crate::core::prompts;
use crate::infrastructure::entities::SubProcessSource;
use crate::infrastructure::llm::{ChatMessage, CompletionRequest, ToolDefinition};
use crate::infrastructure::vector_store::{MetadataFilters, ScoredNode};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Nodes retrieved per document query.
pub const SIMILARITY_TOP_K: usize = 3;

/// Answer returned when retrieval finds nothing to synthesize from.
pub const EMPTY_RESPONSE: &str = "Empty Response";

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub response: String,
    pub source_nodes: Vec<ScoredNode>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, query: &str) -> Result<QueryResponse, EngineError>;

    /// Tools this engine delegates to, if it is a composite.
    fn sub_tools(&self) -> Vec<ToolMetadata> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

impl ToolMetadata {
    /// Function definition offered to the model; the single argument is the
    /// question to forward to the engine.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "input": {
                        "title": "Input",
                        "type": "string",
                    },
                },
                "required": ["input"],
            }),
        }
    }
}

#[derive(Clone)]
pub struct QueryEngineTool {
    pub metadata: ToolMetadata,
    pub query_engine: Arc<dyn QueryEngine>,
}

/// Answers a question from the top matches of one document's index.
pub struct RetrieverQueryEngine {
    index: Arc<VectorIndex>,
    filters: MetadataFilters,
    top_k: usize,
}

impl RetrieverQueryEngine {
    pub fn filters(&self) -> &MetadataFilters {
        &self.filters
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

/// Query engine over `index`, restricted to nodes tagged with `doc_id`.
pub fn index_to_query_engine(doc_id: &str, index: Arc<VectorIndex>) -> RetrieverQueryEngine {
    RetrieverQueryEngine {
        index,
        filters: MetadataFilters::exact(DB_DOC_ID_KEY, doc_id),
        top_k: SIMILARITY_TOP_K,
    }
}

#[async_trait]
impl QueryEngine for RetrieverQueryEngine {
    async fn query(&self, query: &str) -> Result<QueryResponse, EngineError> {
        let service_context = self.index.service_context();
        let nodes = self.index.retrieve(query, &self.filters, self.top_k).await?;

        service_context.events.finished(
            SubProcessSource::Retrieve,
            json!({
                "index_id": self.index.index_id(),
                "query_str": query,
                "nodes": nodes
                    .iter()
                    .map(|n| json!({ "node_id": n.node.node_id, "score": n.score }))
                    .collect::<Vec<_>>(),
            }),
        );

        if nodes.is_empty() {
            return Ok(QueryResponse {
                response: EMPTY_RESPONSE.to_owned(),
                source_nodes: nodes,
            });
        }

        let context_str = nodes
            .iter()
            .map(|n| n.node.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = prompts::text_qa_prompt(&context_str, query)?;

        let completion = service_context
            .llm
            .complete(CompletionRequest::new(
                service_context.model.clone(),
                vec![ChatMessage::user(prompt)],
            ))
            .await?;

        Ok(QueryResponse {
            response: completion.content,
            source_nodes: nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::ServiceContext;
    use crate::core::engine::events::EventSink;
    use crate::core::engine::index::{DocIndexMap, IndexBuilder};
    use crate::core::engine::storage::{STORAGE_CONTEXT_TTL, StorageContextCache};
    use crate::infrastructure::traits::VectorStore;
    use crate::infrastructure::vector_store::FileVectorStore;
    use crate::test_utils::{MockEmbedder, MockLlm};
    use tokio::sync::mpsc;

    const WORDS_A: &str = "apples grow on trees in the orchard every autumn season here";
    const WORDS_B: &str = "bananas ripen in warm climates near the coast during summer";

    struct Fixture {
        _upload_dir: tempfile::TempDir,
        _persist_dir: tempfile::TempDir,
        vector_store: Arc<FileVectorStore>,
        llm: Arc<MockLlm>,
        map: DocIndexMap,
    }

    /// Builds indices for two documents of several chunks each.
    async fn fixture(events: EventSink) -> Fixture {
        let upload_dir = tempfile::tempdir().unwrap();
        let persist_dir = tempfile::tempdir().unwrap();
        std::fs::write(upload_dir.path().join("a.txt"), WORDS_A).unwrap();
        std::fs::write(upload_dir.path().join("b.txt"), WORDS_B).unwrap();

        let vector_store = Arc::new(FileVectorStore::new());
        let builder = IndexBuilder::new(
            upload_dir.path(),
            persist_dir.path(),
            vector_store.clone(),
            Arc::new(StorageContextCache::new(STORAGE_CONTEXT_TTL)),
        );
        let llm = Arc::new(MockLlm::answering("They grow on trees."));
        let service_context = ServiceContext {
            llm: llm.clone(),
            embedder: Arc::new(MockEmbedder::new()),
            model: "test-model".to_owned(),
            chunk_size: 3,
            chunk_overlap: 1,
            events,
        };

        let map = builder
            .build_doc_id_to_index_map(&service_context, &["a.txt".to_owned(), "b.txt".to_owned()])
            .await
            .unwrap();

        Fixture {
            _upload_dir: upload_dir,
            _persist_dir: persist_dir,
            vector_store,
            llm,
            map,
        }
    }

    #[test]
    fn test_tool_definition_takes_single_input() {
        let metadata = ToolMetadata {
            name: "apple_10k".to_owned(),
            description: "A document".to_owned(),
        };

        let definition = metadata.to_definition();
        assert_eq!(definition.name, "apple_10k");
        assert_eq!(definition.parameters["required"], json!(["input"]));
        assert_eq!(definition.parameters["properties"]["input"]["type"], "string");
    }

    #[tokio::test]
    async fn test_index_to_query_engine_filters_by_document() {
        let fixture = fixture(EventSink::noop()).await;
        assert!(fixture.map["a.txt"].node_ids().len() > SIMILARITY_TOP_K);
        assert!(fixture.map["b.txt"].node_ids().len() > SIMILARITY_TOP_K);

        let engine = index_to_query_engine("a.txt", fixture.map["a.txt"].clone());

        assert_eq!(engine.top_k(), 3);
        assert_eq!(engine.filters(), &MetadataFilters::exact(DB_DOC_ID_KEY, "a.txt"));
    }

    #[tokio::test]
    async fn test_query_answers_from_top_matches_of_its_document() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let fixture = fixture(EventSink::new(sender)).await;
        while receiver.try_recv().is_ok() {}

        let engine = index_to_query_engine("a.txt", fixture.map["a.txt"].clone());
        let response = engine.query("where do bananas ripen").await.unwrap();

        assert_eq!(response.response, "They grow on trees.");
        assert_eq!(response.source_nodes.len(), SIMILARITY_TOP_K);
        assert!(response.source_nodes.iter().all(|n| n.node.ref_doc_id == "a.txt"));

        let requests = fixture.llm.requests();
        assert_eq!(requests.len(), 1);
        let prompt = &requests[0].messages[0].content;
        assert!(prompt.contains("where do bananas ripen"));
        assert!(!prompt.contains("bananas ripen in"));

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.source, SubProcessSource::Retrieve);
        assert_eq!(event.metadata["index_id"], "a.txt");
        assert_eq!(event.metadata["nodes"].as_array().unwrap().len(), SIMILARITY_TOP_K);
    }

    #[tokio::test]
    async fn test_query_without_matches_is_empty_response() {
        let fixture = fixture(EventSink::noop()).await;
        fixture.vector_store.delete_document("a.txt").await.unwrap();

        let engine = index_to_query_engine("a.txt", fixture.map["a.txt"].clone());
        let response = engine.query("anything").await.unwrap();

        assert_eq!(response.response, EMPTY_RESPONSE);
        assert!(response.source_nodes.is_empty());
        assert!(fixture.llm.requests().is_empty());
    }
}
