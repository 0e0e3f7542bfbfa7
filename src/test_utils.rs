//! Test doubles for the LLM ports.

use crate::infrastructure::llm::{Completion, CompletionRequest, LlmError};
use crate::infrastructure::traits::{EmbeddingClient, LlmClient};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

type Respond = dyn Fn(&CompletionRequest) -> Completion + Send + Sync;

/// Chat model answering through a closure, recording every request.
pub struct MockLlm {
    respond: Box<Respond>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlm {
    pub fn new(respond: impl Fn(&CompletionRequest) -> Completion + Send + Sync + 'static) -> Self {
        MockLlm {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(text: &str) -> Self {
        let text = text.to_owned();
        MockLlm::new(move |_| Completion::text(text.clone()))
    }

    /// Returns the completions in order, then "Done" once they run out.
    pub fn scripted(completions: Vec<Completion>) -> Self {
        let completions = Mutex::new(VecDeque::from(completions));
        MockLlm::new(move |_| {
            completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Completion::text("Done"))
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, request: CompletionRequest) -> Completion {
        let completion = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        completion
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        Ok(self.answer(request))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        let completion = self.answer(request);
        for piece in completion.content.split_inclusive(' ') {
            let _ = deltas.send(piece.to_owned()).await;
        }
        Ok(completion)
    }
}

const EMBEDDING_DIMENSIONS: usize = 32;

/// Bag-of-words embedder: texts sharing words get similar vectors.
#[derive(Default)]
pub struct MockEmbedder {
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        MockEmbedder::default()
    }

    /// Number of `embed` requests served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; EMBEDDING_DIMENSIONS];
    for word in text.split_whitespace() {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(2166136261u32, |hash, byte| (hash ^ byte as u32).wrapping_mul(16777619));
        vector[bucket as usize % EMBEDDING_DIMENSIONS] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|text| bag_of_words(text)).collect())
    }
}
