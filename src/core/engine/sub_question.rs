//! Decomposes a question into per-document sub-questions and synthesizes
//! their answers.

use super::query_engine::{EMPTY_RESPONSE, QueryEngine, QueryEngineTool, QueryResponse, ToolMetadata};
use super::{EngineError, ServiceContext};
use crate::core::prompts;
use crate::infrastructure::entities::SubProcessSource;
use crate::infrastructure::llm::{
    ChatMessage, Completion, CompletionRequest, LlmError, ToolDefinition,
};
use crate::infrastructure::traits::LlmClient;
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Function the model is forced to call with the generated sub-questions.
pub const SUB_QUESTION_FUNCTION: &str = "SubQuestionList";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub sub_question: String,
    pub tool_name: String,
}

#[derive(Debug, Deserialize)]
struct SubQuestionList {
    #[serde(default)]
    items: Vec<SubQuestion>,
}

/// Pretty JSON object mapping tool names to their descriptions.
pub fn build_tools_text(tools: &[ToolMetadata]) -> String {
    let tools: BTreeMap<&str, &str> = tools
        .iter()
        .map(|tool| (tool.name.as_str(), tool.description.as_str()))
        .collect();
    // a map of strings always serializes
    serde_json::to_string_pretty(&tools).unwrap_or_default()
}

fn sub_question_function() -> ToolDefinition {
    ToolDefinition {
        name: SUB_QUESTION_FUNCTION.to_owned(),
        description: "A list of sub questions, each bound to the tool that can answer it."
            .to_owned(),
        parameters: json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "sub_question": { "type": "string" },
                            "tool_name": { "type": "string" },
                        },
                        "required": ["sub_question", "tool_name"],
                    },
                },
            },
            "required": ["items"],
        }),
    }
}

/// Asks the model for sub-questions through a forced function call.
#[derive(Clone)]
pub struct SubQuestionGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl SubQuestionGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        SubQuestionGenerator { llm, model }
    }

    pub async fn generate(
        &self,
        tools: &[ToolMetadata],
        query: &str,
    ) -> Result<Vec<SubQuestion>, EngineError> {
        let request = self.build_request(tools, query)?;
        let completion = self.llm.complete(request).await?;
        parse_sub_questions(&completion, tools)
    }

    /// Blocking variant of [`SubQuestionGenerator::generate`], for callers
    /// outside an async runtime. Panics if called from within one.
    pub fn generate_blocking(
        &self,
        tools: &[ToolMetadata],
        query: &str,
    ) -> Result<Vec<SubQuestion>, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.generate(tools, query))
    }

    fn build_request(
        &self,
        tools: &[ToolMetadata],
        query: &str,
    ) -> Result<CompletionRequest, EngineError> {
        let prompt =
            prompts::sub_question_prompt(SUB_QUESTION_FUNCTION, &build_tools_text(tools), query)?;

        Ok(
            CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
                .with_tools(vec![sub_question_function()])
                .with_tool_choice(SUB_QUESTION_FUNCTION),
        )
    }
}

/// Reads the function-call arguments and keeps sub-questions naming a known tool.
fn parse_sub_questions(
    completion: &Completion,
    tools: &[ToolMetadata],
) -> Result<Vec<SubQuestion>, EngineError> {
    let arguments = completion
        .tool_calls
        .iter()
        .find(|call| call.function.name == SUB_QUESTION_FUNCTION)
        .map(|call| call.function.arguments.as_str())
        .unwrap_or(completion.content.as_str());

    let list: SubQuestionList = serde_json::from_str(arguments).map_err(|e| {
        LlmError::Parse(format!("invalid {SUB_QUESTION_FUNCTION} arguments: {e}"))
    })?;

    Ok(list
        .items
        .into_iter()
        .filter(|item| {
            let known = tools.iter().any(|tool| tool.name == item.tool_name);
            if !known {
                warn!(
                    "dropping sub question for unknown tool {}: {}",
                    item.tool_name, item.sub_question
                );
            }
            known
        })
        .collect())
}

/// Composite engine answering through the per-document tools.
pub struct SubQuestionQueryEngine {
    tools: Vec<QueryEngineTool>,
    generator: SubQuestionGenerator,
    service_context: ServiceContext,
    doc_titles: String,
}

impl SubQuestionQueryEngine {
    pub fn new(
        tools: Vec<QueryEngineTool>,
        generator: SubQuestionGenerator,
        service_context: ServiceContext,
        doc_titles: String,
    ) -> Self {
        SubQuestionQueryEngine {
            tools,
            generator,
            service_context,
            doc_titles,
        }
    }

    async fn answer_sub_question(
        &self,
        sub_question: &SubQuestion,
    ) -> Result<Option<(SubQuestion, QueryResponse)>, EngineError> {
        let Some(tool) = self
            .tools
            .iter()
            .find(|tool| tool.metadata.name == sub_question.tool_name)
        else {
            return Ok(None);
        };

        let events = &self.service_context.events;
        let event_id = events.start(
            SubProcessSource::SubQuestion,
            json!({ "sub_question": { "question": sub_question.sub_question, "tool_name": sub_question.tool_name } }),
        );

        let response = tool.query_engine.query(&sub_question.sub_question).await?;
        debug!("[{}] A: {}", sub_question.tool_name, response.response);

        let citations: Vec<_> = response
            .source_nodes
            .iter()
            .map(|n| {
                json!({
                    "document_id": n.node.ref_doc_id,
                    "node_id": n.node.node_id,
                    "text": n.node.text,
                    "score": n.score,
                })
            })
            .collect();
        events.end(
            event_id,
            SubProcessSource::SubQuestion,
            json!({
                "sub_question": {
                    "question": sub_question.sub_question,
                    "tool_name": sub_question.tool_name,
                    "answer": response.response,
                    "citations": citations,
                },
            }),
        );

        Ok(Some((sub_question.clone(), response)))
    }
}

#[async_trait]
impl QueryEngine for SubQuestionQueryEngine {
    async fn query(&self, query: &str) -> Result<QueryResponse, EngineError> {
        let metadata = self.sub_tools();
        let sub_questions = self.generator.generate(&metadata, query).await?;
        self.service_context.events.finished(
            SubProcessSource::SubQuestions,
            json!({ "sub_questions": sub_questions }),
        );

        let answers = join_all(sub_questions.iter().map(|sq| self.answer_sub_question(sq)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut qa_pairs = Vec::new();
        let mut source_nodes = Vec::new();
        for (sub_question, response) in answers.into_iter().flatten() {
            qa_pairs.push((sub_question.sub_question, response.response));
            source_nodes.extend(response.source_nodes);
        }

        if qa_pairs.is_empty() {
            return Ok(QueryResponse {
                response: EMPTY_RESPONSE.to_owned(),
                source_nodes,
            });
        }

        let prompt = prompts::sub_question_synthesis_prompt(&self.doc_titles, &qa_pairs, query)?;
        let completion = self
            .service_context
            .llm
            .complete(CompletionRequest::new(
                self.service_context.model.clone(),
                vec![ChatMessage::user(prompt)],
            ))
            .await?;

        Ok(QueryResponse {
            response: completion.content,
            source_nodes,
        })
    }

    fn sub_tools(&self) -> Vec<ToolMetadata> {
        self.tools.iter().map(|tool| tool.metadata.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::events::{EventSink, SubProcessEvent};
    use crate::infrastructure::entities::SubProcessStatus;
    use crate::test_utils::{MockEmbedder, MockLlm};
    use tokio::sync::mpsc;

    struct FixedEngine(&'static str);

    #[async_trait]
    impl QueryEngine for FixedEngine {
        async fn query(&self, _query: &str) -> Result<QueryResponse, EngineError> {
            Ok(QueryResponse {
                response: self.0.to_owned(),
                source_nodes: Vec::new(),
            })
        }
    }

    fn metadata(name: &str) -> ToolMetadata {
        ToolMetadata {
            name: name.to_owned(),
            description: format!("A document({name})"),
        }
    }

    fn tool(name: &str, answer: &'static str) -> QueryEngineTool {
        QueryEngineTool {
            metadata: metadata(name),
            query_engine: Arc::new(FixedEngine(answer)),
        }
    }

    fn sub_question_call(items: serde_json::Value) -> Completion {
        Completion::with_tool_call(
            "call_0",
            SUB_QUESTION_FUNCTION,
            json!({ "items": items }).to_string(),
        )
    }

    #[test]
    fn test_build_tools_text_maps_names_to_descriptions() {
        let text = build_tools_text(&[metadata("a"), metadata("b")]);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({ "a": "A document(a)", "b": "A document(b)" }));
    }

    #[tokio::test]
    async fn test_generator_forces_function_call_and_drops_unknown_tools() {
        let llm = Arc::new(MockLlm::new(|_| {
            sub_question_call(json!([
                { "sub_question": "What is revenue?", "tool_name": "a" },
                { "sub_question": "What is weather?", "tool_name": "nope" },
            ]))
        }));
        let generator = SubQuestionGenerator::new(llm.clone(), "test-model".to_owned());

        let questions = generator
            .generate(&[metadata("a"), metadata("b")], "Compare revenue")
            .await
            .unwrap();

        assert_eq!(
            questions,
            vec![SubQuestion {
                sub_question: "What is revenue?".to_owned(),
                tool_name: "a".to_owned(),
            }]
        );
        let request = &llm.requests()[0];
        assert_eq!(request.tool_choice.as_deref(), Some(SUB_QUESTION_FUNCTION));
        assert!(request.messages[0].content.contains("Compare revenue"));
        assert!(request.messages[0].content.contains("\"a\": \"A document(a)\""));
    }

    #[test]
    fn test_generate_blocking_matches_async() {
        let llm = Arc::new(MockLlm::new(|_| {
            sub_question_call(json!([
                { "sub_question": "q1", "tool_name": "a" },
                { "sub_question": "q2", "tool_name": "b" },
            ]))
        }));
        let generator = SubQuestionGenerator::new(llm, "test-model".to_owned());
        let tools = [metadata("a"), metadata("b")];

        let blocking = generator.generate_blocking(&tools, "query").unwrap();
        let asynchronous = tokio_test::block_on(generator.generate(&tools, "query")).unwrap();

        assert_eq!(blocking, asynchronous);
        assert_eq!(blocking.len(), 2);
    }

    #[tokio::test]
    async fn test_generator_rejects_malformed_arguments() {
        let llm = Arc::new(MockLlm::new(|_| {
            Completion::with_tool_call("call_0", SUB_QUESTION_FUNCTION, "not json")
        }));
        let generator = SubQuestionGenerator::new(llm, "test-model".to_owned());

        let result = generator.generate(&[metadata("a")], "query").await;
        assert!(matches!(result, Err(EngineError::Llm(LlmError::Parse(_)))));
    }

    #[tokio::test]
    async fn test_engine_synthesizes_sub_answers_and_reports_events() {
        let llm = Arc::new(MockLlm::new(|request| {
            if request.tool_choice.is_some() {
                sub_question_call(json!([
                    { "sub_question": "Revenue of a?", "tool_name": "a" },
                    { "sub_question": "Revenue of b?", "tool_name": "b" },
                ]))
            } else {
                Completion::text("a earned more")
            }
        }));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let service_context = ServiceContext {
            llm: llm.clone(),
            embedder: Arc::new(MockEmbedder::new()),
            model: "test-model".to_owned(),
            chunk_size: 64,
            chunk_overlap: 4,
            events: EventSink::new(sender),
        };
        let engine = SubQuestionQueryEngine::new(
            vec![tool("a", "10 dollars"), tool("b", "5 dollars")],
            SubQuestionGenerator::new(llm.clone(), "test-model".to_owned()),
            service_context,
            "- a\n- b".to_owned(),
        );

        let response = engine.query("Who earned more?").await.unwrap();
        assert_eq!(response.response, "a earned more");

        let synthesis = llm.requests().last().unwrap().messages[0].content.clone();
        assert!(synthesis.contains("Sub question: Revenue of a?\nResponse: 10 dollars"));
        assert!(synthesis.contains("Sub question: Revenue of b?\nResponse: 5 dollars"));

        let mut events: Vec<SubProcessEvent> = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert_eq!(events[0].source, SubProcessSource::SubQuestions);
        let finished = events
            .iter()
            .filter(|e| {
                e.source == SubProcessSource::SubQuestion && e.status == SubProcessStatus::Finished
            })
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_engine_without_sub_questions_skips_synthesis() {
        let llm = Arc::new(MockLlm::new(|_| sub_question_call(json!([]))));
        let service_context = ServiceContext {
            llm: llm.clone(),
            embedder: Arc::new(MockEmbedder::new()),
            model: "test-model".to_owned(),
            chunk_size: 64,
            chunk_overlap: 4,
            events: EventSink::noop(),
        };
        let engine = SubQuestionQueryEngine::new(
            vec![tool("a", "unused")],
            SubQuestionGenerator::new(llm.clone(), "test-model".to_owned()),
            service_context,
            "- a".to_owned(),
        );

        let response = engine.query("Anything?").await.unwrap();
        assert_eq!(response.response, EMPTY_RESPONSE);
        assert_eq!(llm.requests().len(), 1);
    }
}
