//! OpenAI-compatible chat-completion and embedding adapters.

use crate::infrastructure::llm::{
    ChatMessage, Completion, CompletionRequest, FunctionCall, LlmError, Role, ToolCall,
    ToolDefinition,
};
use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::{EmbeddingClient, LlmClient};
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiConfig {
    fn from_settings(settings: &Settings) -> Self {
        OpenAiConfig {
            api_key: settings.openai_api_key.clone(),
            base_url: settings.openai_base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn post(&self, client: &Client, path: &str) -> RequestBuilder {
        let request = client
            .post(format!("{}/{}", self.base_url, path))
            .header("Content-Type", "application/json");

        if self.api_key.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

#[injectable(LlmClient)]
impl OpenAiClient {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> OpenAiClient {
        OpenAiClient::new(OpenAiConfig::from_settings(&settings))
    }
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Self {
        OpenAiClient {
            config,
            client: Client::new(),
        }
    }
}

pub struct OpenAiEmbeddings {
    config: OpenAiConfig,
    client: Client,
    model: String,
}

#[injectable(EmbeddingClient)]
impl OpenAiEmbeddings {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> OpenAiEmbeddings {
        OpenAiEmbeddings {
            config: OpenAiConfig::from_settings(&settings),
            client: Client::new(),
            model: settings.embedding_model.clone(),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    temperature: f32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: Role,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: FunctionCall,
}

fn function_type() -> String {
    "function".to_owned()
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        WireMessage {
            role: message.role,
            content: if message.content.is_empty() && !message.tool_calls.is_empty() {
                None
            } else {
                Some(message.content.clone())
            },
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: function_type(),
                    function: call.function.clone(),
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

fn tool_json(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn build_request(request: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: request.model.clone(),
        temperature: request.temperature,
        messages: request.messages.iter().map(WireMessage::from).collect(),
        tools: request.tools.iter().map(tool_json).collect(),
        tool_choice: request
            .tool_choice
            .as_ref()
            .map(|name| json!({ "type": "function", "function": { "name": name } })),
        stream,
    }
}

async fn check_status(response: Response) -> Result<Response, LlmError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(LlmError::Api { status, message })
}

/// Collects raw stream bytes and hands out complete lines, so a multi-byte
/// character split across network chunks is decoded whole.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_owned())
    }
}

/// Applies one streamed chunk, returning `true` once the model signalled completion.
fn apply_stream_chunk(
    data: &str,
    content: &mut String,
    tool_calls: &mut BTreeMap<usize, ToolCallBuffer>,
    pending_deltas: &mut Vec<String>,
) -> bool {
    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("skipping malformed stream chunk: {e}");
            return false;
        }
    };

    let Some(choice) = parsed.choices.into_iter().next() else {
        return false;
    };

    if let Some(text) = choice.delta.content {
        if !text.is_empty() {
            content.push_str(&text);
            pending_deltas.push(text);
        }
    }

    for delta in choice.delta.tool_calls.unwrap_or_default() {
        let buffer = tool_calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            buffer.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                buffer.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                buffer.arguments.push_str(&arguments);
            }
        }
    }

    choice.finish_reason.is_some()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let body = build_request(&request, false);
        let response = self
            .config
            .post(&self.client, "chat/completions")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let data: ChatCompletionResponse = response.json().await?;
        let message = data
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| LlmError::Parse("completion contained no choices".to_owned()))?;

        Ok(Completion {
            content: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    function: call.function,
                })
                .collect(),
        })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        let body = build_request(&request, true);
        let response = self
            .config
            .post(&self.client, "chat/completions")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut content = String::new();
        let mut tool_calls = BTreeMap::new();
        let mut pending_deltas = Vec::new();
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();

        'read: while let Some(chunk) = stream.next().await {
            lines.extend(&chunk?);

            while let Some(line) = lines.next_line() {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }

                let finished =
                    apply_stream_chunk(data, &mut content, &mut tool_calls, &mut pending_deltas);
                for delta in pending_deltas.drain(..) {
                    let _ = deltas.send(delta).await;
                }
                if finished {
                    break 'read;
                }
            }
        }

        debug!(
            "stream finished with {} characters and {} tool calls",
            content.len(),
            tool_calls.len()
        );

        Ok(Completion {
            content,
            tool_calls: tool_calls
                .into_values()
                .map(|call| ToolCall {
                    id: call.id,
                    function: FunctionCall {
                        name: call.name,
                        arguments: call.arguments,
                    },
                })
                .collect(),
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let response = self
            .config
            .post(&self.client, "embeddings")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut data: EmbeddingResponse = response.json().await?;
        if data.data.len() != texts.len() {
            return Err(LlmError::Parse(format!(
                "expected {} embeddings, received {}",
                texts.len(),
                data.data.len()
            )));
        }

        data.data.sort_by_key(|item| item.index);
        Ok(data.data.into_iter().map(|item| item.embedding).collect())
    }
}
