//! Function-calling chat agent with streaming output.

use super::events::EventSink;
use super::query_engine::QueryEngineTool;
use super::EngineError;
use crate::infrastructure::entities::SubProcessSource;
use crate::infrastructure::llm::{ChatMessage, CompletionRequest, ToolCall, ToolDefinition};
use crate::infrastructure::traits::LlmClient;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tool calls the agent may make while answering one message.
pub const MAX_FUNCTION_CALLS: usize = 3;

const FUNCTION_CALL_LIMIT_REACHED: &str =
    "Function call limit reached. Answer with the information gathered so far.";

pub struct ChatAgent {
    tools: Vec<QueryEngineTool>,
    llm: Arc<dyn LlmClient>,
    model: String,
    chat_history: Vec<ChatMessage>,
    system_prompt: String,
    max_function_calls: usize,
    events: EventSink,
}

impl ChatAgent {
    pub fn new(
        tools: Vec<QueryEngineTool>,
        llm: Arc<dyn LlmClient>,
        model: String,
        chat_history: Vec<ChatMessage>,
        system_prompt: String,
        events: EventSink,
    ) -> Self {
        ChatAgent {
            tools,
            llm,
            model,
            chat_history,
            system_prompt,
            max_function_calls: MAX_FUNCTION_CALLS,
            events,
        }
    }

    pub fn with_max_function_calls(mut self, max_function_calls: usize) -> Self {
        self.max_function_calls = max_function_calls;
        self
    }

    pub fn tools(&self) -> &[QueryEngineTool] {
        &self.tools
    }

    pub fn chat_history(&self) -> &[ChatMessage] {
        &self.chat_history
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn max_function_calls(&self) -> usize {
        self.max_function_calls
    }

    /// Answers `message`, sending text deltas of every model turn to `deltas`,
    /// and returns the text of the final turn.
    pub async fn stream_chat(
        &self,
        message: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<String, EngineError> {
        let mut messages = Vec::with_capacity(self.chat_history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.chat_history.iter().cloned());
        messages.push(ChatMessage::user(message));

        let definitions: Vec<ToolDefinition> = self
            .tools
            .iter()
            .map(|tool| tool.metadata.to_definition())
            .collect();
        let mut function_calls = 0;

        loop {
            let mut request = CompletionRequest::new(self.model.clone(), messages.clone());
            let tools_allowed = function_calls < self.max_function_calls && !definitions.is_empty();
            if tools_allowed {
                request = request.with_tools(definitions.clone());
            }

            let completion = self.llm.stream(request, deltas.clone()).await?;
            if completion.tool_calls.is_empty() || !tools_allowed {
                info!("agent finished after {function_calls} function calls");
                return Ok(completion.content);
            }

            let mut assistant = ChatMessage::assistant(completion.content);
            assistant.tool_calls = completion.tool_calls.clone();
            messages.push(assistant);

            for call in &completion.tool_calls {
                let output = if function_calls < self.max_function_calls {
                    function_calls += 1;
                    self.call_tool(call).await?
                } else {
                    warn!("skipping call to {}: limit reached", call.function.name);
                    FUNCTION_CALL_LIMIT_REACHED.to_owned()
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<String, EngineError> {
        let name = &call.function.name;
        let tool = self
            .tools
            .iter()
            .find(|tool| &tool.metadata.name == name)
            .ok_or_else(|| EngineError::UnknownTool(name.clone()))?;

        let input = tool_input(&call.function.arguments);
        debug!("calling {name} with {input}");

        let event_id = self.events.start(
            SubProcessSource::FunctionCall,
            json!({ "function_call": { "name": name, "arguments": call.function.arguments } }),
        );
        let response = tool.query_engine.query(&input).await?;
        self.events.end(
            event_id,
            SubProcessSource::FunctionCall,
            json!({ "function_call": { "name": name, "output": response.response } }),
        );

        Ok(response.response)
    }
}

/// The `input` argument of a tool call, or the raw arguments when absent.
fn tool_input(arguments: &str) -> String {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => match map.get("input") {
            Some(Value::String(input)) => input.clone(),
            Some(other) => other.to_string(),
            None => arguments.to_owned(),
        },
        _ => arguments.to_owned(),
    }
}
